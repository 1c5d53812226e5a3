//! Start/stop sequencing for the registered entity types
//!
//! One watch loop per registered type. [`Operator::start`] is non-blocking;
//! [`Operator::stop`] cancels, awaits every background task to completion
//! and releases resources. Stopping twice is a no-op.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::config::OperatorSettings;
use crate::dispatcher::{DispatchPolicy, Dispatcher, Reconciler};
use crate::entity::Entity;
use crate::finalizer::FinalizerRegistry;
use crate::leader::{LeaderGate, LeaderState};
use crate::requeue;
use crate::selector::SelectorResolver;
use crate::watcher::WatchLoop;

/// Starts one watch loop under the given cancellation scope.
///
/// Called once per leadership acquisition, so everything a watch loop must
/// not carry across transitions is created inside.
pub type Launcher = Arc<dyn Fn(CancellationToken) -> JoinHandle<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("leader election is enabled but no leadership signal was provided")]
    MissingLeadershipSignal,
}

/// Builder accumulating per-type registrations.
pub struct OperatorBuilder {
    settings: OperatorSettings,
    leadership: Option<tokio::sync::watch::Receiver<LeaderState>>,
    launchers: Vec<Launcher>,
}

impl OperatorBuilder {
    #[must_use]
    pub fn new(settings: OperatorSettings) -> Self {
        Self {
            settings,
            leadership: None,
            launchers: Vec::new(),
        }
    }

    /// Leadership signal driving the leader gate; required when leader
    /// election is enabled.
    #[must_use]
    pub fn leadership(mut self, leadership: tokio::sync::watch::Receiver<LeaderState>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Register an entity type: its client, reconciler, finalizers and
    /// label selector.
    ///
    /// The generation cache is created here, once per registration, so its
    /// contents survive leadership transitions; the requeue queue and watch
    /// loop are created fresh on every (re)start.
    #[must_use]
    pub fn watch<K: Entity>(
        mut self,
        client: Arc<dyn Client<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
        finalizers: FinalizerRegistry<K>,
        selector: Arc<dyn SelectorResolver>,
    ) -> Self {
        let cache = self.settings.cache.build();
        let policy = DispatchPolicy {
            auto_attach_finalizers: self.settings.auto_attach_finalizers,
            auto_detach_finalizers: self.settings.auto_detach_finalizers,
        };
        let namespace = self.settings.namespace.clone();
        let finalizers = Arc::new(finalizers);

        let launcher: Launcher = Arc::new(move |scope: CancellationToken| {
            let (requeuer, drain) = requeue::queue::<K>();
            let dispatcher = Dispatcher::new(
                client.clone(),
                cache.clone(),
                requeuer,
                reconciler.clone(),
                finalizers.clone(),
                policy,
            );
            let watch_loop = WatchLoop::new(
                client.clone(),
                dispatcher,
                selector.clone(),
                drain,
                namespace.clone(),
            );
            tokio::spawn(watch_loop.run(scope))
        });
        self.launchers.push(launcher);
        self
    }

    pub fn build(self) -> Result<Operator, BuildError> {
        if self.settings.enable_leader_election && self.leadership.is_none() {
            return Err(BuildError::MissingLeadershipSignal);
        }
        let leadership = if self.settings.enable_leader_election {
            self.leadership
        } else {
            None
        };
        Ok(Operator {
            leadership,
            launchers: self.launchers,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            started: false,
            stopped: false,
        })
    }
}

/// Lifecycle host owning the background tasks of all registered types.
pub struct Operator {
    leadership: Option<tokio::sync::watch::Receiver<LeaderState>>,
    launchers: Vec<Launcher>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl Operator {
    #[must_use]
    pub fn builder(settings: OperatorSettings) -> OperatorBuilder {
        OperatorBuilder::new(settings)
    }

    /// Launches the background tasks and returns immediately. Starting
    /// twice, or after [`stop`](Self::stop), is a no-op.
    pub fn start(&mut self) {
        if self.started || self.stopped {
            return;
        }
        self.started = true;
        match self.leadership.clone() {
            Some(leadership) => {
                let gate = LeaderGate::new(leadership);
                let launchers = self.launchers.clone();
                self.tasks
                    .push(tokio::spawn(gate.run(self.cancel.child_token(), launchers)));
                debug!("operator started behind leader gate");
            }
            None => {
                for launch in &self.launchers {
                    self.tasks.push(launch(self.cancel.child_token()));
                }
                debug!(watchers = self.tasks.len(), "operator started");
            }
        }
    }

    /// Cancels all background tasks and awaits their completion, draining
    /// any in-flight event. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        // Drop the captured clients, caches and reconcilers.
        self.launchers.clear();
        debug!("operator stopped");
    }
}
