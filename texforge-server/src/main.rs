//! TexForge Server
//!
//! Compilation-as-a-service over the LaTeX toolchain: callers submit a
//! document plus named dependency files and receive a compiled PDF (or the
//! diagnostic log), either inline or by polling an async job.
//!
//! Architecture:
//! - Registry: authoritative in-memory job state with lifecycle enforcement
//! - Workspace manager: isolated per-job scratch directories
//! - Pipeline: the multi-pass pdflatex/bibtex sequence
//! - Worker pool: bounded-concurrency execution slots with backpressure
//! - Sweeper: periodic reclamation of expired jobs and their workspaces

pub mod api;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod sweeper;
pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::pipeline::{BuildPipeline, ProcessToolchain};
use crate::pool::WorkerPool;
use crate::registry::JobRegistry;
use crate::sweeper::ExpirySweeper;
use crate::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "texforge_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TexForge server");

    let config = Config::from_env().context("Invalid configuration")?;

    tokio::fs::create_dir_all(&config.scratch_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create scratch root {}",
                config.scratch_root.display()
            )
        })?;

    probe_toolchain(&config).await;

    let registry = Arc::new(JobRegistry::new());
    let workspaces = WorkspaceManager::new(config.scratch_root.clone());
    let toolchain = Arc::new(ProcessToolchain::from_config(&config));
    let pipeline = Arc::new(BuildPipeline::new(toolchain, &config));

    let pool = WorkerPool::start(
        Arc::clone(&registry),
        workspaces.clone(),
        pipeline,
        &config,
    );

    ExpirySweeper::new(Arc::clone(&registry), workspaces.clone(), &config).spawn();

    let app = api::create_router(AppState {
        registry,
        pool,
        workspaces,
    });

    info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

/// Logs whether the external toolchain is reachable. A missing compiler is
/// not fatal at startup; every compile would fail with a clear error anyway,
/// and deployments may mount the toolchain after boot.
async fn probe_toolchain(config: &Config) {
    match tokio::process::Command::new(&config.latex_cmd)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let first_line = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .to_string();
            info!("Toolchain check passed: {}", first_line);
        }
        Ok(output) => {
            warn!(
                "Toolchain check: {} exited with {}",
                config.latex_cmd, output.status
            );
        }
        Err(err) => {
            warn!(
                "Toolchain check failed, {} not runnable: {}",
                config.latex_cmd, err
            );
        }
    }
}
