//! Expiry sweeper
//!
//! Background task that reclaims jobs past their retention window, removing
//! both the registry entry and any workspace directory still on disk. Jobs
//! that are mid-run are never touched; only terminal and stuck-pending jobs
//! age out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::registry::JobRegistry;
use crate::workspace::WorkspaceManager;

/// Periodic job reclamation task
pub struct ExpirySweeper {
    registry: Arc<JobRegistry>,
    workspaces: WorkspaceManager,
    retention: chrono::Duration,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<JobRegistry>, workspaces: WorkspaceManager, config: &Config) -> Self {
        Self {
            registry,
            workspaces,
            retention: chrono::Duration::from_std(config.retention)
                .unwrap_or(chrono::Duration::MAX),
            interval: config.sweep_interval,
        }
    }

    /// Spawns the sweep loop; runs for the life of the process.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(
            "Expiry sweeper started (interval: {:?}, retention: {})",
            self.interval, self.retention
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick would sweep at startup; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = self.sweep_once(Utc::now()).await;
                if swept > 0 {
                    info!("Swept {} expired job(s)", swept);
                } else {
                    debug!("Sweep tick: nothing expired");
                }
            }
        })
    }

    /// One sweep over the registry at the given instant. Separated from the
    /// timer loop so expiry behavior is testable without waiting.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let expired = self.registry.list_expired(now, self.retention);
        let mut swept = 0;

        for (id, workspace) in expired {
            if let Some(path) = workspace {
                self.workspaces.destroy(&path).await;
            }
            if self.registry.remove(id).is_some() {
                debug!("Expired job removed: {}", id);
                swept += 1;
            }
        }

        swept
    }
}
