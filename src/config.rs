//! Operator-level configuration

use std::fmt;
use std::sync::Arc;

use crate::cache::{GenerationCache, KeyValueStore, LayeredCache, MemoryCache};

/// Generation cache construction options, supplied through
/// [`OperatorSettings::configure_cache`].
#[derive(Clone)]
pub struct CacheSettings {
    /// Prefix for keys written to the external store.
    pub key_prefix: String,
    /// Optional distributed backend; without one the cache is process-local.
    pub store: Option<Arc<dyn KeyValueStore>>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: "operator".to_string(),
            store: None,
        }
    }
}

impl fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSettings")
            .field("key_prefix", &self.key_prefix)
            .field("store", &self.store.as_ref().map(|_| "<distributed>"))
            .finish()
    }
}

impl CacheSettings {
    pub(crate) fn build(&self) -> Arc<dyn GenerationCache> {
        match &self.store {
            Some(store) => Arc::new(LayeredCache::new(store.clone(), self.key_prefix.clone())),
            None => Arc::new(MemoryCache::new()),
        }
    }
}

/// Recognised operator options.
#[derive(Clone, Debug, Default)]
pub struct OperatorSettings {
    /// Restrict watches to one namespace; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Gate watch loops behind the leader gate.
    pub enable_leader_election: bool,
    /// Add registered finalizer identifiers before reconciliation.
    pub auto_attach_finalizers: bool,
    /// Remove the matched identifier after a successful finalize call.
    pub auto_detach_finalizers: bool,
    pub cache: CacheSettings,
}

impl OperatorSettings {
    /// Restrict the watch to one namespace; an empty string means all
    /// namespaces.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        };
        self
    }

    #[must_use]
    pub fn all_namespaces(mut self) -> Self {
        self.namespace = None;
        self
    }

    #[must_use]
    pub fn leader_election(mut self, enabled: bool) -> Self {
        self.enable_leader_election = enabled;
        self
    }

    #[must_use]
    pub fn auto_attach_finalizers(mut self, enabled: bool) -> Self {
        self.auto_attach_finalizers = enabled;
        self
    }

    #[must_use]
    pub fn auto_detach_finalizers(mut self, enabled: bool) -> Self {
        self.auto_detach_finalizers = enabled;
        self
    }

    /// Adjust cache construction (key prefix, distributed backend).
    #[must_use]
    pub fn configure_cache(mut self, configure: impl FnOnce(&mut CacheSettings)) -> Self {
        configure(&mut self.cache);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::OperatorSettings;

    #[test]
    fn empty_namespace_means_all() {
        let settings = OperatorSettings::default().namespace("");
        assert_eq!(settings.namespace, None);
        let settings = OperatorSettings::default().namespace("prod");
        assert_eq!(settings.namespace.as_deref(), Some("prod"));
        assert_eq!(settings.all_namespaces().namespace, None);
    }

    #[test]
    fn cache_hook_adjusts_settings() {
        let settings = OperatorSettings::default()
            .leader_election(true)
            .configure_cache(|cache| cache.key_prefix = "myop".into());
        assert!(settings.enable_leader_election);
        assert_eq!(settings.cache.key_prefix, "myop");
    }
}
