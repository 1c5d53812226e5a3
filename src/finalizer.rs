//! Finalizer registration and identifier derivation
//!
//! Kubernetes gates deletion on `metadata.finalizers`; each identifier is
//! owned by one controller, which removes it once cleanup is done. The
//! registry maps identifiers to user-supplied [`Finalizer`]s; the
//! dispatcher consults it when a deleting object still carries finalizers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::ReconciliationResult;
use crate::entity::Entity;

/// Longest identifier the apiserver accepts in `metadata.finalizers`.
const MAX_IDENTIFIER_LEN: usize = 63;

const SUFFIX: &str = "finalizer";

/// Cleanup hook invoked while an entity is pending deletion.
#[async_trait]
pub trait Finalizer<K: Entity>: Send + Sync + 'static {
    async fn finalize(&self, entity: &K, cancel: &CancellationToken) -> ReconciliationResult;
}

/// Finalizers registered for one entity type, keyed by identifier.
pub struct FinalizerRegistry<K: Entity> {
    entries: BTreeMap<String, Arc<dyn Finalizer<K>>>,
}

impl<K: Entity> Default for FinalizerRegistry<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Entity> FinalizerRegistry<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the identifier derived from `F`'s type name; returns
    /// the identifier the entity will carry.
    pub fn register<F: Finalizer<K>>(&mut self, finalizer: F) -> String {
        let id = identifier::<K>(unqualified_type_name::<F>());
        self.register_as(id.clone(), Arc::new(finalizer));
        id
    }

    /// Registers under an explicit identifier, replacing any previous entry.
    pub fn register_as(&mut self, identifier: impl Into<String>, finalizer: Arc<dyn Finalizer<K>>) {
        self.entries.insert(identifier.into(), finalizer);
    }

    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&Arc<dyn Finalizer<K>>> {
        self.entries.get(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derives the finalizer identifier for a name under `K`'s group:
/// `"{group}/{name}"` lowercased, with a `finalizer` suffix appended when
/// missing, truncated to 63 characters.
#[must_use]
pub fn identifier<K: Entity>(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with(SUFFIX) {
        name.push_str(SUFFIX);
    }
    let mut id = format!("{}/{name}", K::GROUP.to_ascii_lowercase());
    id.truncate(MAX_IDENTIFIER_LEN);
    id
}

fn unqualified_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
