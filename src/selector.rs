//! Label selector resolution for watch subscriptions
//!
//! The resolver is consulted once per (re)connect, so a dynamic
//! implementation can rotate the selector without restarting the operator.
//! Resolution errors are treated like any other connect failure: the watch
//! loop logs them and reconnects with backoff.

use async_trait::async_trait;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait SelectorResolver: Send + Sync + 'static {
    /// The label selector to apply, or `None` to watch everything.
    async fn resolve(&self) -> Result<Option<String>, BoxError>;
}

/// Fixed selector (or none), the common case.
#[derive(Clone, Debug, Default)]
pub struct StaticSelector(Option<String>);

impl StaticSelector {
    /// Watch everything.
    #[must_use]
    pub fn all() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn new(selector: impl Into<String>) -> Self {
        Self(Some(selector.into()))
    }
}

#[async_trait]
impl SelectorResolver for StaticSelector {
    async fn resolve(&self) -> Result<Option<String>, BoxError> {
        Ok(self.0.clone())
    }
}

/// Builder for `key1=value1,key2!=value2` selector strings.
///
/// Supports `=` and `!=`; the comma joins clauses conjunctively, matching
/// the apiserver's labelSelector query parameter.
#[derive(Clone, Debug, Default)]
pub struct LabelSelector {
    clauses: Vec<String>,
}

impl LabelSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.clauses.push(format!("{key}={value}"));
        self
    }

    #[must_use]
    pub fn neq(mut self, key: &str, value: &str) -> Self {
        self.clauses.push(format!("{key}!={value}"));
        self
    }

    #[must_use]
    pub fn build(&self) -> String {
        self.clauses.join(",")
    }

    #[must_use]
    pub fn into_resolver(self) -> StaticSelector {
        if self.clauses.is_empty() {
            StaticSelector::all()
        } else {
            StaticSelector::new(self.build())
        }
    }
}
