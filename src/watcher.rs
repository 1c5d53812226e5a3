//! Resumable watch loop per entity type
//!
//! Wraps the client's lazy, finite-per-connection watch stream in a
//! restartable outer loop: bookmarks advance the resource version cursor,
//! 410 Gone drops it (forcing re-list semantics), 504 and benign stream
//! ends reconnect immediately, and anything else reconnects after a
//! jittered exponential backoff. Events are dispatched one at a time; a
//! new event is not consumed until the previous reconciliation returned.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::client::{Client, Error as ClientError, WatchEvent, WatchParams};
use crate::dispatcher::{Dispatcher, TriggerSource};
use crate::entity::{Entity, EntityExt};
use crate::requeue::{RequeueKind, RequeueQueue};
use crate::selector::SelectorResolver;

const MAX_EXPONENT: u32 = 5;

/// Reconnect backoff: `2^n` seconds for the n-th consecutive error, clamped
/// at `2^5`, plus up to a second of jitter. Reset whenever the stream
/// delivers a processable event, so a long-lived healthy stream never stays
/// pinned at the maximum.
#[derive(Debug, Default)]
pub struct WatchBackoff {
    attempts: u32,
}

impl Backoff for WatchBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        let exponent = self.attempts.min(MAX_EXPONENT);
        let jitter = rand::thread_rng().gen_range(0..1000);
        Some(Duration::from_secs(1 << exponent) + Duration::from_millis(jitter))
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// How a connect or stream error affects the outer loop.
enum Disruption {
    /// 410 Gone: the cursor expired; drop it and re-list.
    Desync,
    /// 504 or a benign end of body; reconnect keeping the cursor.
    Interrupted,
    /// Anything else; reconnect after backoff.
    Transient,
}

fn classify(err: &ClientError) -> Disruption {
    match err {
        ClientError::Api(status) if status.code == 410 => Disruption::Desync,
        ClientError::Api(status) if status.code == 504 => Disruption::Interrupted,
        ClientError::UnexpectedEnd => Disruption::Interrupted,
        _ => Disruption::Transient,
    }
}

/// One logical watch subscription for an entity type.
pub struct WatchLoop<K: Entity> {
    client: Arc<dyn Client<K>>,
    dispatcher: Dispatcher<K>,
    selector: Arc<dyn SelectorResolver>,
    requeue: RequeueQueue<K>,
    namespace: Option<String>,
    resource_version: Option<String>,
    backoff: WatchBackoff,
}

impl<K: Entity> WatchLoop<K> {
    #[must_use]
    pub fn new(
        client: Arc<dyn Client<K>>,
        dispatcher: Dispatcher<K>,
        selector: Arc<dyn SelectorResolver>,
        requeue: RequeueQueue<K>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            selector,
            requeue,
            namespace,
            resource_version: None,
            backoff: WatchBackoff::default(),
        }
    }

    /// Runs until `cancel` fires. Operational faults are handled internally;
    /// nothing is surfaced to the caller.
    #[allow(clippy::too_many_lines)]
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            client,
            dispatcher,
            selector,
            mut requeue,
            namespace,
            mut resource_version,
            mut backoff,
        } = self;

        'reconnect: loop {
            if cancel.is_cancelled() {
                break;
            }

            let label_selector = match selector.resolve().await {
                Ok(selector) => selector,
                Err(err) => {
                    warn!(kind = K::KIND, error = %err, "label selector resolution failed");
                    if sleep_backoff(&mut backoff, &cancel).await {
                        continue;
                    }
                    break;
                }
            };

            let params = WatchParams {
                namespace: namespace.clone(),
                resource_version: resource_version.clone(),
                label_selector,
                allow_bookmarks: true,
            };
            debug!(
                kind = K::KIND,
                resource_version = params.resource_version.as_deref().unwrap_or_default(),
                "opening watch"
            );

            let mut stream = tokio::select! {
                () = cancel.cancelled() => break,
                subscribed = client.watch(&params) => match subscribed {
                    Ok(stream) => stream,
                    Err(err) => match classify(&err) {
                        Disruption::Desync => {
                            warn!(kind = K::KIND, error = %err, "watch desynchronized, relisting from scratch");
                            resource_version = None;
                            continue;
                        }
                        Disruption::Interrupted => {
                            debug!(kind = K::KIND, error = %err, "watch interrupted, resubscribing");
                            continue;
                        }
                        Disruption::Transient => {
                            warn!(kind = K::KIND, error = %err, "failed to open watch");
                            if sleep_backoff(&mut backoff, &cancel).await {
                                continue;
                            }
                            break;
                        }
                    },
                },
            };

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break 'reconnect,
                    entry = requeue.next() => match entry {
                        Some(entry) => {
                            dispatch(
                                &dispatcher,
                                entry.kind,
                                &entry.entity,
                                TriggerSource::Operator,
                                &cancel,
                            )
                            .await;
                        }
                        // Drain closed; nothing will ever be re-delivered.
                        None => break 'reconnect,
                    },
                    event = stream.next() => match event {
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            debug!(
                                kind = K::KIND,
                                resource_version = %bookmark.resource_version,
                                "received bookmark"
                            );
                            resource_version = Some(bookmark.resource_version);
                            backoff.reset();
                        }
                        Some(Ok(WatchEvent::Error(status))) => match status.code {
                            410 => {
                                warn!(kind = K::KIND, "watch desynchronized, relisting from scratch");
                                resource_version = None;
                                continue 'reconnect;
                            }
                            504 => {
                                debug!(kind = K::KIND, "gateway timeout on watch stream, resubscribing");
                                continue 'reconnect;
                            }
                            _ => {
                                warn!(
                                    kind = K::KIND,
                                    code = status.code,
                                    message = %status.message,
                                    "watch stream error"
                                );
                                if sleep_backoff(&mut backoff, &cancel).await {
                                    continue 'reconnect;
                                }
                                break 'reconnect;
                            }
                        },
                        Some(Ok(WatchEvent::Added(entity))) => {
                            dispatch(&dispatcher, RequeueKind::Added, &entity, TriggerSource::ApiServer, &cancel).await;
                            backoff.reset();
                        }
                        Some(Ok(WatchEvent::Modified(entity))) => {
                            dispatch(&dispatcher, RequeueKind::Modified, &entity, TriggerSource::ApiServer, &cancel).await;
                            backoff.reset();
                        }
                        Some(Ok(WatchEvent::Deleted(entity))) => {
                            dispatch(&dispatcher, RequeueKind::Deleted, &entity, TriggerSource::ApiServer, &cancel).await;
                            backoff.reset();
                        }
                        Some(Err(err)) => match classify(&err) {
                            Disruption::Desync => {
                                warn!(kind = K::KIND, error = %err, "watch desynchronized, relisting from scratch");
                                resource_version = None;
                                continue 'reconnect;
                            }
                            Disruption::Interrupted => {
                                debug!(kind = K::KIND, error = %err, "watch interrupted, resubscribing");
                                continue 'reconnect;
                            }
                            Disruption::Transient => {
                                warn!(kind = K::KIND, error = %err, "watch stream failed");
                                if sleep_backoff(&mut backoff, &cancel).await {
                                    continue 'reconnect;
                                }
                                break 'reconnect;
                            }
                        },
                        None => {
                            debug!(kind = K::KIND, "watch stream ended, resubscribing");
                            continue 'reconnect;
                        }
                    },
                }
            }
        }

        debug!(kind = K::KIND, "watch loop stopped");
    }
}

/// Dispatches one event inside a per-event tracing span.
async fn dispatch<K: Entity>(
    dispatcher: &Dispatcher<K>,
    kind: RequeueKind,
    entity: &K,
    source: TriggerSource,
    cancel: &CancellationToken,
) {
    let event_type = match kind {
        RequeueKind::Added => "Added",
        RequeueKind::Modified => "Modified",
        RequeueKind::Deleted => "Deleted",
    };
    let span = info_span!(
        "processing event",
        event_type,
        kind = K::KIND,
        name = %entity.name(),
        namespace = entity.namespace().unwrap_or_default(),
        resource_version = entity.resource_version().unwrap_or_default(),
    );
    async {
        debug!("received event");
        let _result = match kind {
            RequeueKind::Added => dispatcher.reconcile_creation(entity, source, cancel).await,
            RequeueKind::Modified => {
                dispatcher
                    .reconcile_modification(entity, source, cancel)
                    .await
            }
            RequeueKind::Deleted => dispatcher.reconcile_deletion(entity, source, cancel).await,
        };
        // Requeues were already scheduled by the dispatcher; failures were
        // logged there with full context.
    }
    .instrument(span)
    .await;
}

/// Sleeps the next backoff interval; returns `false` when cancelled.
async fn sleep_backoff(backoff: &mut WatchBackoff, cancel: &CancellationToken) -> bool {
    let Some(delay) = backoff.next_backoff() else {
        return !cancel.is_cancelled();
    };
    debug!(?delay, "backing off before reconnecting");
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
