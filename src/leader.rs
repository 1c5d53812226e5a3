//! Leadership-gated activation of watch loops
//!
//! When leader election is enabled, watch loops run only while this replica
//! holds the lease. Leadership transitions arrive on a `watch` channel; each
//! acquisition starts the registered launchers under a fresh cancellation
//! scope, and each loss cancels that scope and awaits full shutdown before
//! waiting for the next acquisition. Generation caches survive transitions
//! (launchers capture them); the watch loops themselves never do.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::host::Launcher;

/// Observed lease state for this replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// This replica holds the lease.
    Leading,
    /// Another replica holds the lease.
    Following,
    /// Lease state unknown, or the elector is starting/stopping.
    Standby,
}

impl LeaderState {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leading)
    }
}

/// Starts and stops launchers as leadership comes and goes.
pub struct LeaderGate {
    leadership: tokio::sync::watch::Receiver<LeaderState>,
}

impl LeaderGate {
    #[must_use]
    pub fn new(leadership: tokio::sync::watch::Receiver<LeaderState>) -> Self {
        Self { leadership }
    }

    /// Runs until `cancel` fires or the leadership channel closes. Watchers
    /// started on acquisition are cancelled and awaited on loss.
    pub async fn run(mut self, cancel: CancellationToken, launchers: Vec<Launcher>) {
        loop {
            if !self.wait_until(true, &cancel).await {
                return;
            }
            info!("leadership acquired, starting watchers");
            let scope = cancel.child_token();
            let tasks: Vec<_> = launchers.iter().map(|launch| launch(scope.clone())).collect();

            let keep_running = self.wait_until(false, &cancel).await;
            scope.cancel();
            for task in tasks {
                let _ = task.await;
            }
            if !keep_running {
                return;
            }
            info!("leadership lost, watchers stopped");
        }
    }

    /// Waits until `is_leader() == leading`; `false` on cancellation or a
    /// closed channel.
    async fn wait_until(&mut self, leading: bool, cancel: &CancellationToken) -> bool {
        loop {
            if self.leadership.borrow_and_update().is_leader() == leading {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                changed = self.leadership.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
