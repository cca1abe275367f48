//! Server configuration
//!
//! Defines all configurable parameters for the compile service: network
//! binding, scratch storage, pool sizing, pass timeouts, retention, and the
//! log-detection heuristics for the build pipeline.

use std::path::PathBuf;
use std::time::Duration;

/// Compile service configuration
///
/// All timeouts and intervals are configurable to allow tuning for different
/// deployment scenarios (interactive dev loops vs batch translation runs).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to
    pub bind_addr: String,

    /// Root directory under which per-job workspaces are created
    pub scratch_root: PathBuf,

    /// Maximum number of concurrently executing build pipelines
    pub pool_size: usize,

    /// Maximum number of accepted-but-not-yet-running async jobs
    pub queue_capacity: usize,

    /// Execution budget for one primary-compiler pass
    pub pass_timeout: Duration,

    /// Execution budget for one bibliography-processor pass
    pub bib_timeout: Duration,

    /// How long a terminal or never-started job is retained before sweeping
    pub retention: Duration,

    /// How often the expiry sweeper runs
    pub sweep_interval: Duration,

    /// Primary compiler executable (e.g. "pdflatex")
    pub latex_cmd: String,

    /// Bibliography processor executable (e.g. "bibtex")
    pub bibtex_cmd: String,

    /// Markers scanned for in the aux file / first-pass log to decide
    /// whether a bibliography pass is needed. The detection is a heuristic,
    /// so the markers are configuration rather than constants.
    pub citation_markers: Vec<String>,

    /// Markers in a pass log that classify the run as a fatal compiler error
    /// (a non-zero exit alone is commonly just warnings).
    pub fatal_markers: Vec<String>,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Recognized variables (all optional):
    /// - TEXFORGE_BIND_ADDR (default: 0.0.0.0:9851)
    /// - TEXFORGE_SCRATCH_ROOT (default: <system temp>/texforge)
    /// - TEXFORGE_POOL_SIZE (default: 4)
    /// - TEXFORGE_QUEUE_CAPACITY (default: 16)
    /// - TEXFORGE_PASS_TIMEOUT_SECS (default: 120)
    /// - TEXFORGE_BIB_TIMEOUT_SECS (default: 60)
    /// - TEXFORGE_RETENTION_SECS (default: 86400)
    /// - TEXFORGE_SWEEP_INTERVAL_SECS (default: 3600)
    /// - TEXFORGE_LATEX_CMD (default: pdflatex)
    /// - TEXFORGE_BIBTEX_CMD (default: bibtex)
    /// - TEXFORGE_CITATION_MARKERS (comma-separated)
    /// - TEXFORGE_FATAL_MARKERS (comma-separated)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TEXFORGE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(root) = std::env::var("TEXFORGE_SCRATCH_ROOT") {
            config.scratch_root = PathBuf::from(root);
        }
        if let Some(n) = env_parse::<usize>("TEXFORGE_POOL_SIZE") {
            config.pool_size = n;
        }
        if let Some(n) = env_parse::<usize>("TEXFORGE_QUEUE_CAPACITY") {
            config.queue_capacity = n;
        }
        if let Some(secs) = env_parse::<u64>("TEXFORGE_PASS_TIMEOUT_SECS") {
            config.pass_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TEXFORGE_BIB_TIMEOUT_SECS") {
            config.bib_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TEXFORGE_RETENTION_SECS") {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TEXFORGE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Ok(cmd) = std::env::var("TEXFORGE_LATEX_CMD") {
            config.latex_cmd = cmd;
        }
        if let Ok(cmd) = std::env::var("TEXFORGE_BIBTEX_CMD") {
            config.bibtex_cmd = cmd;
        }
        if let Some(markers) = env_list("TEXFORGE_CITATION_MARKERS") {
            config.citation_markers = markers;
        }
        if let Some(markers) = env_list("TEXFORGE_FATAL_MARKERS") {
            config.fatal_markers = markers;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }
        if self.pass_timeout.is_zero() || self.bib_timeout.is_zero() {
            anyhow::bail!("pass timeouts must be greater than 0");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than 0");
        }
        if self.latex_cmd.is_empty() || self.bibtex_cmd.is_empty() {
            anyhow::bail!("toolchain commands cannot be empty");
        }
        if self.citation_markers.is_empty() {
            anyhow::bail!("citation_markers cannot be empty");
        }
        if self.fatal_markers.is_empty() {
            anyhow::bail!("fatal_markers cannot be empty");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9851".to_string(),
            scratch_root: std::env::temp_dir().join("texforge"),
            pool_size: 4,
            queue_capacity: 16,
            pass_timeout: Duration::from_secs(120),
            bib_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            latex_cmd: "pdflatex".to_string(),
            bibtex_cmd: "bibtex".to_string(),
            citation_markers: vec!["\\citation".to_string(), "\\bibdata".to_string()],
            fatal_markers: vec![
                "Fatal error occurred".to_string(),
                "Emergency stop".to_string(),
                "! LaTeX Error".to_string(),
                "! Undefined control sequence".to_string(),
            ],
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|s| {
        s.split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect()
    })
}
