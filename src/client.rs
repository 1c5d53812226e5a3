//! Narrow facade over the Kubernetes API consumed by the runtime core
//!
//! The REST/watch transport is not part of this crate; implementations of
//! [`Client`] are injected by the embedding application (or by tests). The
//! core only needs a typed watch subscription, metadata-writing updates and
//! point reads.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;

use crate::entity::Entity;

/// Status payload returned by the apiserver for failed requests and for
/// in-stream `Error` events.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Error)]
#[error("{message}: {reason}")]
#[serde(default)]
pub struct ErrorResponse {
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected, or the stream terminated, by the apiserver.
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),
    /// The response body ended before a complete event was read.
    ///
    /// Some ingresses answer a watch on an empty collection with an empty
    /// body; the watch loop treats this as "no instances yet" and resubscribes.
    #[error("watch response ended mid-stream")]
    UnexpectedEnd,
    /// Transport-level failure (connection reset, TLS, DNS, ...).
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single event from a watch subscription.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Synthetic cursor advance; never forwarded to user code.
    Bookmark(Bookmark),
    /// In-stream status object, e.g. 410 Gone when the cursor expired.
    Error(ErrorResponse),
}

impl<K> WatchEvent<K> {
    /// The wire-level event type, for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "Added",
            WatchEvent::Modified(_) => "Modified",
            WatchEvent::Deleted(_) => "Deleted",
            WatchEvent::Bookmark(_) => "Bookmark",
            WatchEvent::Error(_) => "Error",
        }
    }
}

/// Payload of a `Bookmark` event: only a fresh resource version.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bookmark {
    pub resource_version: String,
}

/// Options for one watch subscription.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WatchParams {
    /// Restrict to one namespace; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Cursor to resume from; `None` forces re-list semantics.
    pub resource_version: Option<String>,
    pub label_selector: Option<String>,
    /// Request `Bookmark` events for improved cursor precision.
    pub allow_bookmarks: bool,
}

/// The watch stream handed out by a [`Client`].
///
/// Each stream is one connection: lazy, finite and non-restartable. The
/// watch loop wraps it in a restartable outer loop.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// The narrow client interface the runtime core consumes.
#[async_trait]
pub trait Client<K: Entity>: Send + Sync + 'static {
    /// Open a watch subscription for `K`.
    async fn watch(&self, params: &WatchParams) -> Result<WatchStream<K>>;

    /// Persist the entity, writing `metadata.finalizers` edits through.
    async fn update(&self, entity: &K) -> Result<K>;

    /// Point read by name; `None` when the object does not exist.
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>>;
}
