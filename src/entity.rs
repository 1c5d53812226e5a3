//! Structural contract for the objects the runtime watches
//!
//! The core never inspects an entity beyond the metadata subset modelled by
//! [`EntityMeta`]; everything else (spec, status, ...) travels through
//! opaquely. Registered types implement [`Entity`] to expose that subset
//! plus their static type information.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// The metadata subset the runtime core reads and writes.
///
/// Field names serialize in the Kubernetes wire casing so client facade
/// implementations can embed this directly in their object shapes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityMeta {
    /// Stable opaque identifier; survives name reuse, unlike `namespace/name`.
    pub uid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Advanced by the apiserver only on spec changes, never on status writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Opaque cursor into the watch stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Set once deletion has been requested; the object lingers while
    /// `finalizers` is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// An accessor trait for watched Kubernetes objects.
///
/// Types that know their group/version/kind at compile time implement this
/// directly; the associated consts mirror the generated static type info of
/// apimachinery-derived types.
pub trait Entity: Clone + std::fmt::Debug + Send + Sync + 'static {
    const KIND: &'static str;
    const GROUP: &'static str;
    const VERSION: &'static str;

    /// `{group}/{version}`, or bare `{version}` for the core group.
    fn api_version() -> Cow<'static, str> {
        if Self::GROUP.is_empty() {
            Cow::Borrowed(Self::VERSION)
        } else {
            Cow::Owned(format!("{}/{}", Self::GROUP, Self::VERSION))
        }
    }

    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;
}

/// Convenience accessors over [`Entity::meta`].
pub trait EntityExt: Entity {
    fn uid(&self) -> &str {
        &self.meta().uid
    }

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn deletion_timestamp(&self) -> Option<&str> {
        self.meta().deletion_timestamp.as_deref()
    }

    fn finalizers(&self) -> &[String] {
        &self.meta().finalizers
    }

    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        &mut self.meta_mut().finalizers
    }
}

impl<K: Entity> EntityExt for K {}
