//! Shared test doubles: a registered entity type, a scripted client and a
//! counting reconciler.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, Result, WatchEvent, WatchParams, WatchStream};
use crate::dispatcher::{ReconciliationResult, Reconciler};
use crate::entity::{Entity, EntityMeta};
use crate::finalizer::Finalizer;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct TestResource {
    pub metadata: EntityMeta,
}

impl TestResource {
    pub(crate) fn new(uid: &str) -> Self {
        Self::named(uid, uid)
    }

    pub(crate) fn named(uid: &str, name: &str) -> Self {
        Self {
            metadata: EntityMeta {
                uid: uid.to_string(),
                name: name.to_string(),
                namespace: Some("default".to_string()),
                ..EntityMeta::default()
            },
        }
    }
}

impl Entity for TestResource {
    const KIND: &'static str = "TestResource";
    const GROUP: &'static str = "example.com";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &EntityMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.metadata
    }
}

/// One scripted watch connection.
pub(crate) enum WatchScript {
    /// Yield the events, then end the stream.
    Finite(Vec<Result<WatchEvent<TestResource>>>),
    /// Yield the events, then stay open until cancelled.
    Open(Vec<Result<WatchEvent<TestResource>>>),
}

/// Client returning scripted watch connections in order and recording every
/// call. Once the script runs out, connections stay open and idle.
#[derive(Default)]
pub(crate) struct MockClient {
    scripts: Mutex<VecDeque<WatchScript>>,
    params: Mutex<Vec<WatchParams>>,
    updates: Mutex<Vec<TestResource>>,
    watched: Notify,
}

impl MockClient {
    pub(crate) fn script_watch(&self, script: WatchScript) {
        self.scripts.lock().push_back(script);
    }

    pub(crate) fn watch_params(&self) -> Vec<WatchParams> {
        self.params.lock().clone()
    }

    pub(crate) fn updates(&self) -> Vec<TestResource> {
        self.updates.lock().clone()
    }

    /// Waits until at least `n` watch connections have been opened.
    pub(crate) async fn wait_for_watches(&self, n: usize) {
        loop {
            let notified = self.watched.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.params.lock().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Client<TestResource> for MockClient {
    async fn watch(&self, params: &WatchParams) -> Result<WatchStream<TestResource>> {
        self.params.lock().push(params.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| WatchScript::Open(Vec::new()));
        self.watched.notify_waiters();
        Ok(match script {
            WatchScript::Finite(events) => stream::iter(events).boxed(),
            WatchScript::Open(events) => stream::iter(events).chain(stream::pending()).boxed(),
        })
    }

    async fn update(&self, entity: &TestResource) -> Result<TestResource> {
        self.updates.lock().push(entity.clone());
        Ok(entity.clone())
    }

    async fn get(&self, _name: &str, _namespace: Option<&str>) -> Result<Option<TestResource>> {
        Ok(None)
    }
}

/// Reconciler recording every invocation; results can be scripted per call
/// and default to plain success.
#[derive(Default)]
pub(crate) struct MockReconciler {
    reconciled: Mutex<Vec<TestResource>>,
    deleted: Mutex<Vec<TestResource>>,
    reconcile_results: Mutex<VecDeque<ReconciliationResult>>,
    deleted_results: Mutex<VecDeque<ReconciliationResult>>,
    invoked: Notify,
}

impl MockReconciler {
    pub(crate) fn script_reconcile(&self, result: ReconciliationResult) {
        self.reconcile_results.lock().push_back(result);
    }

    pub(crate) fn script_deleted(&self, result: ReconciliationResult) {
        self.deleted_results.lock().push_back(result);
    }

    pub(crate) fn reconciled(&self) -> Vec<TestResource> {
        self.reconciled.lock().clone()
    }

    pub(crate) fn reconcile_count(&self) -> usize {
        self.reconciled.lock().len()
    }

    pub(crate) fn deleted_count(&self) -> usize {
        self.deleted.lock().len()
    }

    /// Waits until `reconcile` has been invoked at least `n` times.
    pub(crate) async fn wait_for_reconciles(&self, n: usize) {
        loop {
            let notified = self.invoked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.reconciled.lock().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Reconciler<TestResource> for MockReconciler {
    async fn reconcile(
        &self,
        entity: &TestResource,
        _cancel: &CancellationToken,
    ) -> ReconciliationResult {
        self.reconciled.lock().push(entity.clone());
        let result = self
            .reconcile_results
            .lock()
            .pop_front()
            .unwrap_or_else(ReconciliationResult::success);
        self.invoked.notify_waiters();
        result
    }

    async fn deleted(
        &self,
        entity: &TestResource,
        _cancel: &CancellationToken,
    ) -> ReconciliationResult {
        self.deleted.lock().push(entity.clone());
        let result = self
            .deleted_results
            .lock()
            .pop_front()
            .unwrap_or_else(ReconciliationResult::success);
        self.invoked.notify_waiters();
        result
    }
}

/// Finalizer recording invocations, with an optionally scripted result.
#[derive(Default)]
pub(crate) struct MockFinalizer {
    finalized: Mutex<Vec<TestResource>>,
    results: Mutex<VecDeque<ReconciliationResult>>,
}

impl MockFinalizer {
    pub(crate) fn script(&self, result: ReconciliationResult) {
        self.results.lock().push_back(result);
    }

    pub(crate) fn finalize_count(&self) -> usize {
        self.finalized.lock().len()
    }
}

#[async_trait]
impl Finalizer<TestResource> for MockFinalizer {
    async fn finalize(
        &self,
        entity: &TestResource,
        _cancel: &CancellationToken,
    ) -> ReconciliationResult {
        self.finalized.lock().push(entity.clone());
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(ReconciliationResult::success)
    }
}
