//! Relay supervisor: one [`PortListener`] task per mapping entry.
//!
//! Listeners are independent. A port that fails to bind disables only its
//! own mapping, and nothing a listener or session hits propagates up here
//! beyond the [`ListenerExit`] it returns.

use crate::config::RelayConfig;
use crate::listener::{ListenerExit, PortListener};
use crate::shutdown::ShutdownRx;
use portrelay_core::{MappingTable, RelaySettings};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Tally of how the listeners ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Mappings whose port could not be bound.
    pub bind_failures: usize,
    /// Listeners stopped by shutdown.
    pub stopped: usize,
    /// Listeners stopped by a fatal accept error (or a panic).
    pub failed: usize,
}

impl SupervisorReport {
    /// Listeners that bound successfully.
    pub fn started(&self) -> usize {
        self.stopped + self.failed
    }
}

pub struct RelaySupervisor {
    mappings: MappingTable,
    settings: Arc<RelaySettings>,
}

impl RelaySupervisor {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            mappings: config.mappings,
            settings: Arc::new(config.settings),
        }
    }

    /// Start every listener concurrently and wait until all have finished.
    ///
    /// Without a shutdown request this only returns if every listener
    /// failed to bind or hit a fatal accept error.
    pub async fn run(self, shutdown: ShutdownRx) -> SupervisorReport {
        let mut listeners = JoinSet::new();
        let count = self.mappings.len();

        for entry in self.mappings {
            listeners.spawn(PortListener::start(
                entry,
                Arc::clone(&self.settings),
                shutdown.clone(),
            ));
        }
        info!(listeners = count, bind = %self.settings.bind_address, "relay supervisor started");

        let mut report = SupervisorReport::default();
        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok(ListenerExit::BindFailed(_)) => report.bind_failures += 1,
                Ok(ListenerExit::Shutdown) => report.stopped += 1,
                Ok(ListenerExit::Failed(e)) => {
                    warn!(error = %e, "listener stopped");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "listener task failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            started = report.started(),
            bind_failures = report.bind_failures,
            failed = report.failed,
            "all listeners stopped"
        );
        report
    }
}
