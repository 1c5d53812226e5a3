//! Runtime core for building Kubernetes operators
//!
//! This crate contains the machinery that turns a stream of cluster-side
//! resource change events into serialized, deduplicated, retry-capable
//! invocations of user reconciliation logic: a resumable watch loop, a
//! generation-gated dispatcher, a timed requeue queue, finalizer
//! coordination and a leadership gate.
//!
//! The Kubernetes transport itself is injected through the narrow
//! [`Client`] facade; users supply a [`Reconciler`] (and optionally
//! [`Finalizer`]s) per entity type and drive everything through
//! [`Operator`].

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod finalizer;
pub mod host;
pub mod leader;
pub mod requeue;
pub mod selector;
pub mod watcher;

#[cfg(test)]
pub(crate) mod fixtures;

pub use cache::GenerationCache;
pub use client::Client;
pub use config::OperatorSettings;
pub use dispatcher::{Outcome, ReconciliationResult, Reconciler, TriggerSource};
pub use entity::{Entity, EntityExt, EntityMeta};
pub use finalizer::{Finalizer, FinalizerRegistry};
pub use host::{Operator, OperatorBuilder};
pub use leader::LeaderState;
