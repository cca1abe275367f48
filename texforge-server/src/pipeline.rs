//! Build pipeline
//!
//! Runs the fixed multi-pass compile sequence against a staged workspace:
//! a first pdflatex pass, an optional bibtex pass when the document both
//! ships a `.bib` dependency and shows unresolved citations, then the
//! follow-up pdflatex passes that stabilize references. References are only
//! guaranteed stable after a pass that sees nothing left to resolve, hence
//! the third pass on the bibliography path.
//!
//! Toolchain invocation sits behind the [`Toolchain`] trait so tests can
//! script pass outcomes without a TeX installation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use texforge_core::domain::job::{CompileResult, FailureKind};

use crate::config::Config;
use crate::workspace::Workspace;

/// Captured output of one toolchain pass
#[derive(Debug, Clone)]
pub struct PassOutput {
    /// Whether the process exited with status zero. A non-zero exit is
    /// commonly just warnings; the pipeline decides based on the log.
    pub exit_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl PassOutput {
    fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Toolchain invocation error
#[derive(Debug)]
pub enum PassError {
    /// The pass exceeded its execution budget and was killed.
    Timeout(Duration),
    /// The process could not be spawned or awaited.
    Spawn(std::io::Error),
}

/// Seam between the pipeline and the external TeX toolchain
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// One primary-compiler pass over `tex_file` inside `workspace`.
    async fn latex_pass(&self, workspace: &Path, tex_file: &str) -> Result<PassOutput, PassError>;

    /// One bibliography-processor pass over `<output_name>.aux`.
    async fn bibtex_pass(
        &self,
        workspace: &Path,
        output_name: &str,
    ) -> Result<PassOutput, PassError>;
}

/// Real toolchain running pdflatex/bibtex as child processes
///
/// Each pass is an isolated child process with its own timeout; a hung
/// compiler in one job cannot affect others.
pub struct ProcessToolchain {
    latex_cmd: String,
    bibtex_cmd: String,
    pass_timeout: Duration,
    bib_timeout: Duration,
}

impl ProcessToolchain {
    pub fn from_config(config: &Config) -> Self {
        Self {
            latex_cmd: config.latex_cmd.clone(),
            bibtex_cmd: config.bibtex_cmd.clone(),
            pass_timeout: config.pass_timeout,
            bib_timeout: config.bib_timeout,
        }
    }

    async fn run(
        mut command: Command,
        budget: Duration,
    ) -> Result<PassOutput, PassError> {
        // Dropping the output future on timeout kills the child.
        command.kill_on_drop(true);
        let output = tokio::time::timeout(budget, command.output())
            .await
            .map_err(|_| PassError::Timeout(budget))?
            .map_err(PassError::Spawn)?;

        Ok(PassOutput {
            exit_ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn latex_pass(&self, workspace: &Path, tex_file: &str) -> Result<PassOutput, PassError> {
        let mut command = Command::new(&self.latex_cmd);
        command
            .args(["-interaction=nonstopmode", "-file-line-error", "-synctex=1"])
            .arg(tex_file)
            .current_dir(workspace);
        Self::run(command, self.pass_timeout).await
    }

    async fn bibtex_pass(
        &self,
        workspace: &Path,
        output_name: &str,
    ) -> Result<PassOutput, PassError> {
        let mut command = Command::new(&self.bibtex_cmd);
        command
            .arg(format!("{output_name}.aux"))
            .current_dir(workspace);
        Self::run(command, self.bib_timeout).await
    }
}

/// Orchestrates the pass sequence for one job
pub struct BuildPipeline {
    toolchain: Arc<dyn Toolchain>,
    citation_markers: Vec<String>,
    fatal_markers: Vec<String>,
}

enum PassAbort {
    Fatal { pass: u32, marker: String },
    Timeout { pass: u32 },
    Internal { pass: u32, message: String },
}

impl BuildPipeline {
    pub fn new(toolchain: Arc<dyn Toolchain>, config: &Config) -> Self {
        Self {
            toolchain,
            citation_markers: config.citation_markers.clone(),
            fatal_markers: config.fatal_markers.clone(),
        }
    }

    /// Runs the full pass sequence and always returns a terminal result;
    /// every diagnostic line produced along the way ends up in the result
    /// log regardless of outcome.
    pub async fn run(&self, workspace: &Workspace) -> CompileResult {
        let mut log: Vec<String> = Vec::new();

        if let Err(abort) = self.latex_pass(workspace, 1, &mut log).await {
            return self.abort_result(abort, log);
        }

        let with_bibliography = workspace.has_bib
            && self.citations_detected(workspace, &log).await;

        if with_bibliography {
            log.push("citation markers found, running bibliography pass".to_string());
            self.bibtex_pass(workspace, &mut log).await;

            for pass in [2, 3] {
                if let Err(abort) = self.latex_pass(workspace, pass, &mut log).await {
                    return self.abort_result(abort, log);
                }
            }
        } else {
            log.push("no bibliography pass needed".to_string());
            if let Err(abort) = self.latex_pass(workspace, 2, &mut log).await {
                return self.abort_result(abort, log);
            }
        }

        self.collect_artifact(workspace, log).await
    }

    async fn latex_pass(
        &self,
        workspace: &Workspace,
        pass: u32,
        log: &mut Vec<String>,
    ) -> Result<(), PassAbort> {
        log.push(format!("pdflatex pass {pass}: {}", workspace.tex_file));

        let output = match self
            .toolchain
            .latex_pass(&workspace.path, &workspace.tex_file)
            .await
        {
            Ok(output) => output,
            Err(PassError::Timeout(budget)) => {
                log.push(format!(
                    "pdflatex pass {pass} exceeded its {}s budget and was killed",
                    budget.as_secs()
                ));
                return Err(PassAbort::Timeout { pass });
            }
            Err(PassError::Spawn(err)) => {
                log.push(format!("pdflatex pass {pass} could not run: {err}"));
                return Err(PassAbort::Internal {
                    pass,
                    message: err.to_string(),
                });
            }
        };

        let combined = output.combined();
        if !combined.is_empty() {
            log.push(combined.clone());
        }

        if let Some(marker) = self.find_fatal_marker(&combined) {
            log.push(format!("pdflatex pass {pass} hit fatal marker: {marker}"));
            return Err(PassAbort::Fatal { pass, marker });
        }

        if !output.exit_ok {
            // Recoverable warnings commonly exit non-zero; keep going and
            // judge by the artifact.
            log.push(format!("pdflatex pass {pass} exited non-zero, continuing"));
        }
        Ok(())
    }

    /// A failing bibliography pass degrades the output (unresolved
    /// citations) but never sinks the build.
    async fn bibtex_pass(&self, workspace: &Workspace, log: &mut Vec<String>) {
        log.push(format!("bibtex: {}.aux", workspace.output_name));

        match self
            .toolchain
            .bibtex_pass(&workspace.path, &workspace.output_name)
            .await
        {
            Ok(output) => {
                let combined = output.combined();
                if !combined.is_empty() {
                    log.push(combined);
                }
                if !output.exit_ok {
                    log.push("bibtex exited non-zero, continuing without it".to_string());
                }
            }
            Err(PassError::Timeout(budget)) => {
                log.push(format!(
                    "bibtex exceeded its {}s budget, continuing without it",
                    budget.as_secs()
                ));
            }
            Err(PassError::Spawn(err)) => {
                log.push(format!("bibtex could not run: {err}, continuing without it"));
            }
        }
    }

    /// Heuristic bibliography detection: scan the aux file the first pass
    /// produced, falling back to the pass log. The marker list is
    /// configuration because the detection is known to be approximate.
    async fn citations_detected(&self, workspace: &Workspace, log: &[String]) -> bool {
        let aux = workspace
            .path
            .join(format!("{}.aux", workspace.output_name));
        let haystack = match tokio::fs::read_to_string(&aux).await {
            Ok(content) => content,
            Err(_) => log.join("\n"),
        };
        self.citation_markers
            .iter()
            .any(|marker| haystack.contains(marker.as_str()))
    }

    fn find_fatal_marker(&self, log: &str) -> Option<String> {
        self.fatal_markers
            .iter()
            .find(|marker| log.contains(marker.as_str()))
            .cloned()
    }

    async fn collect_artifact(&self, workspace: &Workspace, mut log: Vec<String>) -> CompileResult {
        let pdf = workspace
            .path
            .join(format!("{}.pdf", workspace.output_name));

        match tokio::fs::read(&pdf).await {
            Ok(bytes) => {
                log.push(format!("artifact produced: {} bytes", bytes.len()));
                CompileResult::succeeded(bytes, log.join("\n"))
            }
            Err(_) => {
                // Pull in the compiler's own log file for diagnostics, the
                // way the interactive workflow would read it.
                let tex_log = workspace
                    .path
                    .join(format!("{}.log", workspace.output_name));
                if let Ok(content) = tokio::fs::read_to_string(&tex_log).await {
                    log.push(content);
                }
                log.push("no PDF artifact found after final pass".to_string());
                CompileResult::failed(
                    FailureKind::ArtifactMissing,
                    "compiler produced no PDF artifact",
                    log.join("\n"),
                )
            }
        }
    }

    fn abort_result(&self, abort: PassAbort, log: Vec<String>) -> CompileResult {
        let log = log.join("\n");
        match abort {
            PassAbort::Timeout { pass } => CompileResult::failed(
                FailureKind::Timeout,
                format!("pdflatex pass {pass} timed out"),
                log,
            ),
            PassAbort::Fatal { pass, marker } => CompileResult::failed(
                FailureKind::CompilerFatal,
                format!("fatal compiler error in pass {pass} ({marker})"),
                log,
            ),
            PassAbort::Internal { pass, message } => CompileResult::failed(
                FailureKind::InternalFault,
                format!("pdflatex pass {pass} failed to execute: {message}"),
                log,
            ),
        }
    }
}
