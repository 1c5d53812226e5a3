//! Classifies incoming events and drives reconciler and finalizer calls
//!
//! The dispatcher decides, per event, whether to invoke the user
//! reconciler, skip (duplicate or status-only change), or run finalizer
//! cleanup. User failures never abort the operator; they are logged with
//! structured context and, when a requeue delay is attached, retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::GenerationCache;
use crate::client::Client;
use crate::entity::{Entity, EntityExt};
use crate::finalizer::FinalizerRegistry;
use crate::requeue::{RequeueKind, Requeuer};

/// Where an event entered the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TriggerSource {
    /// Delivered by the apiserver watch stream.
    ApiServer,
    /// Re-delivered by the requeue queue.
    Operator,
}

/// Terminal state of one reconciliation attempt.
#[derive(Clone)]
pub enum Outcome {
    Success,
    Failure {
        message: String,
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Failure { message, cause } => f
                .debug_struct("Failure")
                .field("message", message)
                .field("cause", &cause.as_ref().map(ToString::to_string))
                .finish(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failure {
                message,
                cause: Some(cause),
            } => write!(f, "{message}: {cause}"),
            Outcome::Failure { message, cause: None } => f.write_str(message),
        }
    }
}

/// What one reconciliation attempt produced.
#[derive(Clone, Debug)]
pub struct ReconciliationResult {
    pub outcome: Outcome,
    /// Ask the runtime to re-deliver the entity after this delay.
    pub requeue_after: Option<Duration>,
}

impl ReconciliationResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure {
                message: message.into(),
                cause: None,
            },
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn failure_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            outcome: Outcome::Failure {
                message: message.into(),
                cause: Some(Arc::new(cause)),
            },
            requeue_after: None,
        }
    }

    /// Attach a requeue delay.
    #[must_use]
    pub fn requeue_after(mut self, delay: Duration) -> Self {
        self.requeue_after = Some(delay);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }
}

/// User reconciliation logic for one entity type.
#[async_trait]
pub trait Reconciler<K: Entity>: Send + Sync + 'static {
    /// Invoked for created/modified events that pass the generation gate.
    async fn reconcile(&self, entity: &K, cancel: &CancellationToken) -> ReconciliationResult;

    /// Invoked for deleted events.
    async fn deleted(&self, entity: &K, cancel: &CancellationToken) -> ReconciliationResult;
}

/// Finalizer handling toggles for one entity type.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchPolicy {
    /// Append registered identifiers to `metadata.finalizers` before
    /// reconciling spec changes.
    pub auto_attach_finalizers: bool,
    /// Remove the matched identifier after a successful finalize call.
    pub auto_detach_finalizers: bool,
}

/// Event classifier and reconciler driver for one entity type.
pub struct Dispatcher<K: Entity> {
    client: Arc<dyn Client<K>>,
    cache: Arc<dyn GenerationCache>,
    requeuer: Requeuer<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    finalizers: Arc<FinalizerRegistry<K>>,
    policy: DispatchPolicy,
}

impl<K: Entity> Dispatcher<K> {
    #[must_use]
    pub fn new(
        client: Arc<dyn Client<K>>,
        cache: Arc<dyn GenerationCache>,
        requeuer: Requeuer<K>,
        reconciler: Arc<dyn Reconciler<K>>,
        finalizers: Arc<FinalizerRegistry<K>>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            requeuer,
            reconciler,
            finalizers,
            policy,
        }
    }

    /// Handles an `Added` event (or an `Added`-kind re-delivery).
    pub async fn reconcile_creation(
        &self,
        entity: &K,
        source: TriggerSource,
        cancel: &CancellationToken,
    ) -> ReconciliationResult {
        if cancel.is_cancelled() {
            return ReconciliationResult::success();
        }
        self.requeuer.remove(entity);

        if entity.deletion_timestamp().is_some() {
            debug!(
                kind = K::KIND,
                name = %entity.name(),
                "added object is already marked for deletion, leaving it to the deletion path"
            );
            return ReconciliationResult::success();
        }

        if source == TriggerSource::ApiServer && self.cached_generation(entity).await.is_some() {
            debug!(kind = K::KIND, name = %entity.name(), "object already cached, nothing to reconcile");
            return ReconciliationResult::success();
        }
        self.store_generation(entity, entity.generation().unwrap_or(0))
            .await;

        let entity = match self.attach_missing_finalizers(entity).await {
            Ok(Some(updated)) => updated,
            Ok(None) => entity.clone(),
            Err(failure) => return self.complete(entity, "Added", failure, RequeueKind::Added),
        };

        let result = self.reconciler.reconcile(&entity, cancel).await;
        let kind = if result.is_success() {
            RequeueKind::Modified
        } else {
            RequeueKind::Added
        };
        self.complete(&entity, "Added", result, kind)
    }

    /// Handles a `Modified` event (or a `Modified`-kind re-delivery).
    pub async fn reconcile_modification(
        &self,
        entity: &K,
        source: TriggerSource,
        cancel: &CancellationToken,
    ) -> ReconciliationResult {
        if cancel.is_cancelled() {
            return ReconciliationResult::success();
        }
        self.requeuer.remove(entity);

        if entity.deletion_timestamp().is_none() {
            if source == TriggerSource::ApiServer {
                let current = entity.generation().unwrap_or(1);
                if let Some(cached) = self.cached_generation(entity).await {
                    if cached >= current {
                        debug!(
                            kind = K::KIND,
                            name = %entity.name(),
                            generation = current,
                            "generation unchanged, skipping reconciliation"
                        );
                        return ReconciliationResult::success();
                    }
                }
                self.store_generation(entity, current).await;
            }

            let entity = match self.attach_missing_finalizers(entity).await {
                Ok(Some(updated)) => updated,
                Ok(None) => entity.clone(),
                Err(failure) => {
                    return self.complete(entity, "Modified", failure, RequeueKind::Modified)
                }
            };
            let result = self.reconciler.reconcile(&entity, cancel).await;
            return self.complete(&entity, "Modified", result, RequeueKind::Modified);
        }

        if entity.finalizers().is_empty() {
            return ReconciliationResult::success();
        }
        let (entity, result) = self.finalize(entity, cancel).await;
        self.complete(&entity, "Modified", result, RequeueKind::Modified)
    }

    /// Handles a `Deleted` event (or a `Deleted`-kind re-delivery).
    pub async fn reconcile_deletion(
        &self,
        entity: &K,
        _source: TriggerSource,
        cancel: &CancellationToken,
    ) -> ReconciliationResult {
        if cancel.is_cancelled() {
            return ReconciliationResult::success();
        }
        self.requeuer.remove(entity);

        let result = self.reconciler.deleted(entity, cancel).await;
        if result.is_success() {
            self.evict(entity).await;
        }
        self.complete(entity, "Deleted", result, RequeueKind::Deleted)
    }

    /// One finalizer per pass: the `Modified` event raised by detaching it
    /// brings the next one back through here.
    ///
    /// Returns the entity as it stands after the pass, so the caller
    /// schedules requeues against the post-detach object rather than one
    /// still carrying the removed identifier.
    async fn finalize(&self, entity: &K, cancel: &CancellationToken) -> (K, ReconciliationResult) {
        let Some(id) = entity.finalizers().first().cloned() else {
            return (entity.clone(), ReconciliationResult::success());
        };
        let Some(finalizer) = self.finalizers.get(&id) else {
            info!(
                kind = K::KIND,
                name = %entity.name(),
                identifier = %id,
                "no finalizer registered under identifier, assuming another controller owns it"
            );
            return (entity.clone(), ReconciliationResult::success());
        };

        let result = finalizer.finalize(entity, cancel).await;
        if !result.is_success() {
            return (entity.clone(), result);
        }
        if self.policy.auto_detach_finalizers {
            let mut updated = entity.clone();
            updated.finalizers_mut().retain(|f| f != &id);
            match self.client.update(&updated).await {
                Ok(persisted) => {
                    debug!(kind = K::KIND, name = %entity.name(), identifier = %id, "finalizer detached");
                    return (persisted, result);
                }
                Err(err) => {
                    let mut failure =
                        ReconciliationResult::failure_with_cause("failed to detach finalizer", err);
                    failure.requeue_after = result.requeue_after;
                    return (entity.clone(), failure);
                }
            }
        }
        (entity.clone(), result)
    }

    /// Appends registered identifiers missing from the object and persists
    /// them; the reconciler then sees the persisted object.
    async fn attach_missing_finalizers(&self, entity: &K) -> Result<Option<K>, ReconciliationResult> {
        if !self.policy.auto_attach_finalizers || self.finalizers.is_empty() {
            return Ok(None);
        }
        let missing: Vec<String> = self
            .finalizers
            .identifiers()
            .filter(|id| !entity.finalizers().iter().any(|f| f == id))
            .map(str::to_owned)
            .collect();
        if missing.is_empty() {
            return Ok(None);
        }
        let mut updated = entity.clone();
        updated.finalizers_mut().extend(missing);
        match self.client.update(&updated).await {
            Ok(persisted) => Ok(Some(persisted)),
            Err(err) => Err(ReconciliationResult::failure_with_cause(
                "failed to attach finalizers",
                err,
            )),
        }
    }

    /// Logs failures and schedules the requeue carried by the result.
    fn complete(
        &self,
        entity: &K,
        event_type: &'static str,
        result: ReconciliationResult,
        kind: RequeueKind,
    ) -> ReconciliationResult {
        if let Outcome::Failure { message, cause } = &result.outcome {
            warn!(
                kind = K::KIND,
                name = %entity.name(),
                namespace = entity.namespace().unwrap_or_default(),
                event_type,
                error = %message,
                cause = cause.as_ref().map(ToString::to_string),
                "reconciliation failed"
            );
        }
        if let Some(delay) = result.requeue_after {
            self.requeuer.enqueue(entity.clone(), kind, delay);
        }
        result
    }

    async fn cached_generation(&self, entity: &K) -> Option<i64> {
        match self.cache.try_get(entity.uid()).await {
            Ok(generation) => generation,
            Err(err) => {
                warn!(
                    kind = K::KIND,
                    uid = %entity.uid(),
                    error = %err,
                    "generation cache read failed, treating object as unseen"
                );
                None
            }
        }
    }

    async fn store_generation(&self, entity: &K, generation: i64) {
        if let Err(err) = self.cache.set(entity.uid(), generation).await {
            warn!(
                kind = K::KIND,
                uid = %entity.uid(),
                error = %err,
                "generation cache write failed"
            );
        }
    }

    async fn evict(&self, entity: &K) {
        if let Err(err) = self.cache.remove(entity.uid()).await {
            warn!(
                kind = K::KIND,
                uid = %entity.uid(),
                error = %err,
                "generation cache eviction failed"
            );
        }
    }
}
