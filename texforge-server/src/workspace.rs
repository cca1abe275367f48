//! Workspace management
//!
//! Each compile job gets a private scratch directory under the configured
//! root, named by job id so concurrent jobs can never collide. Staging
//! materializes the primary document and all caller-supplied dependency
//! files into it; destroy removes the whole directory.
//!
//! Caller-supplied filenames are untrusted. Every materialized path is
//! validated component-by-component to remain inside the workspace root
//! before anything is written. This is the service's only real security
//! boundary.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

/// Workspace staging error
#[derive(Debug)]
pub enum StageError {
    /// The output name or a dependency key is path-unsafe.
    InvalidName(String),
    /// Disk error while creating or writing workspace files.
    Io(std::io::Error),
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Io(err)
    }
}

/// A staged, single-owner scratch directory for one job
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    /// Primary document filename inside the workspace (`<output_name>.tex`).
    pub tex_file: String,
    pub output_name: String,
    /// Whether any staged dependency is a bibliography database.
    pub has_bib: bool,
}

/// Creates and tears down per-job workspaces
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validates caller-supplied names without touching the filesystem.
    ///
    /// Used by the async submission path to reject bad input before a job
    /// is created.
    pub fn validate_request<'a>(
        output_name: &str,
        dependency_names: impl Iterator<Item = &'a str>,
    ) -> Result<(), StageError> {
        validate_output_name(output_name)?;
        let tex_file = format!("{output_name}.tex");
        for name in dependency_names {
            validate_dependency_name(name)?;
            if name == tex_file {
                return Err(StageError::InvalidName(format!(
                    "dependency '{name}' collides with the primary document"
                )));
            }
        }
        Ok(())
    }

    /// Materializes the primary document and dependencies for one job.
    pub async fn stage(
        &self,
        job_id: Uuid,
        tex_content: &str,
        output_name: &str,
        dependencies: &HashMap<String, Vec<u8>>,
    ) -> Result<Workspace, StageError> {
        Self::validate_request(output_name, dependencies.keys().map(String::as_str))?;

        let path = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&path).await?;

        let tex_file = format!("{output_name}.tex");
        tokio::fs::write(path.join(&tex_file), tex_content.as_bytes()).await?;

        let mut has_bib = false;
        for (name, bytes) in dependencies {
            let target = path.join(name);
            // Validated above, but keep the containment check next to the
            // write it protects.
            if !target.starts_with(&path) {
                return Err(StageError::InvalidName(format!(
                    "dependency '{name}' escapes the workspace"
                )));
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, bytes).await?;
            if name.ends_with(".bib") {
                has_bib = true;
            }
            tracing::debug!("Staged dependency {} ({} bytes)", name, bytes.len());
        }

        tracing::info!(
            "Workspace staged for job {} at {} ({} dependencies)",
            job_id,
            path.display(),
            dependencies.len()
        );

        Ok(Workspace {
            path,
            tex_file,
            output_name: output_name.to_string(),
            has_bib,
        })
    }

    /// Best-effort recursive removal of a workspace directory.
    ///
    /// Cleanup failures are logged, never raised; neither the pool nor the
    /// sweeper may die on a stubborn temp directory.
    pub async fn destroy(&self, path: &Path) {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => tracing::debug!("Workspace removed: {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!("Failed to remove workspace {}: {}", path.display(), err);
            }
        }
    }
}

/// The output name becomes a filename stem; it must be a single plain
/// path component.
fn validate_output_name(name: &str) -> Result<(), StageError> {
    if name.is_empty() {
        return Err(StageError::InvalidName("output name is empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(StageError::InvalidName(format!(
            "output name '{name}' contains a path separator"
        )));
    }
    if name == "." || name == ".." {
        return Err(StageError::InvalidName(format!(
            "output name '{name}' is a traversal component"
        )));
    }
    Ok(())
}

/// Dependency keys may contain subdirectories but must stay relative and
/// descend only: no root, no prefix, no `..`.
fn validate_dependency_name(name: &str) -> Result<(), StageError> {
    if name.is_empty() || name.contains('\0') {
        return Err(StageError::InvalidName(
            "dependency name is empty or contains NUL".to_string(),
        ));
    }
    // Backslash is a plain filename byte on unix, but accepting it would
    // let Windows-style traversal sequences through unparsed.
    if name.contains('\\') {
        return Err(StageError::InvalidName(format!(
            "dependency '{name}' contains a backslash"
        )));
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => {
                return Err(StageError::InvalidName(format!(
                    "dependency '{name}' is absolute or contains traversal"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().to_path_buf());
        (dir, manager)
    }

    #[tokio::test]
    async fn test_stage_writes_document_and_dependencies() {
        let (_dir, manager) = manager();
        let mut deps = HashMap::new();
        deps.insert("refs.bib".to_string(), b"@article{k}".to_vec());
        deps.insert("figures/plot.png".to_string(), vec![0x89, 0x50]);

        let ws = manager
            .stage(Uuid::new_v4(), "\\documentclass{article}", "paper", &deps)
            .await
            .unwrap();

        assert!(ws.has_bib);
        assert_eq!(ws.tex_file, "paper.tex");
        assert_eq!(
            std::fs::read_to_string(ws.path.join("paper.tex")).unwrap(),
            "\\documentclass{article}"
        );
        assert_eq!(
            std::fs::read(ws.path.join("figures/plot.png")).unwrap(),
            vec![0x89, 0x50]
        );
    }

    #[tokio::test]
    async fn test_stage_without_bib() {
        let (_dir, manager) = manager();
        let ws = manager
            .stage(Uuid::new_v4(), "x", "doc", &HashMap::new())
            .await
            .unwrap();
        assert!(!ws.has_bib);
    }

    #[tokio::test]
    async fn test_traversal_keys_are_rejected() {
        let (dir, manager) = manager();
        for bad in ["../escape.tex", "a/../../b", "/etc/passwd", "..\\win"] {
            let mut deps = HashMap::new();
            deps.insert(bad.to_string(), vec![1]);
            let err = manager
                .stage(Uuid::new_v4(), "x", "doc", &deps)
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::InvalidName(_)), "key: {bad}");
        }
        // Nothing escaped the per-job directory into the scratch root.
        assert!(!dir.path().join("escape.tex").exists());
    }

    #[tokio::test]
    async fn test_bad_output_names_are_rejected() {
        let (_dir, manager) = manager();
        for bad in ["", "..", "a/b", "a\\b"] {
            let err = manager
                .stage(Uuid::new_v4(), "x", bad, &HashMap::new())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::InvalidName(_)), "name: {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_dependency_cannot_shadow_primary() {
        let (_dir, manager) = manager();
        let mut deps = HashMap::new();
        deps.insert("doc.tex".to_string(), b"\\evil".to_vec());
        let err = manager
            .stage(Uuid::new_v4(), "x", "doc", &deps)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (_dir, manager) = manager();
        let ws = manager
            .stage(Uuid::new_v4(), "x", "doc", &HashMap::new())
            .await
            .unwrap();

        manager.destroy(&ws.path).await;
        assert!(!ws.path.exists());

        // Second destroy of a gone directory is silent.
        manager.destroy(&ws.path).await;
    }
}
