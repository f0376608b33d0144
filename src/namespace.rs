//! Namespace registry and lifecycle.
//!
//! Namespaces give tenants fully disjoint key spaces: every partition
//! key a limiter writes is prefixed with an opaque 11-character id. The
//! registry under the reserved `_` namespace maps human names to ids in
//! both directions. Deletion is two-phase — a soft delete marks the
//! name, a purge then removes every record under the id's prefix.

use std::sync::Arc;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::config::SCHEMA_VERSION;
use crate::error::{Error, Result};
use crate::kernel::{SystemTimeSource, TimeSource};
use crate::keys::{self, ATTR_SCHEMA};
use crate::repository::{Repository, RetryPolicy};
use crate::store::{AttrValue, Item, Store, get_bool, get_n, get_s};

/// Length of a generated namespace id.
const NAMESPACE_ID_LEN: usize = 11;

const ATTR_NS_ID: &str = "ns_id";
const ATTR_NAME: &str = "name";
const ATTR_CREATED: &str = "created_ms";
const ATTR_DELETED: &str = "deleted";

/// Handle on the namespace registry.
pub struct NamespaceRegistry<S: Store> {
    repo: Repository<S>,
    time: Arc<dyn TimeSource>,
}

impl<S: Store> NamespaceRegistry<S> {
    /// Creates a registry handle over a store adapter.
    pub fn new(store: S) -> Self {
        Self {
            repo: Repository::new(store, RetryPolicy::default()),
            time: Arc::new(SystemTimeSource),
        }
    }

    /// Overrides the clock. Intended for deterministic tests.
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Registers a name and returns the generated namespace id to bind
    /// limiters to. Fails if the name is already registered.
    pub async fn register(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.contains('/') || name.contains('#') {
            return Err(Error::Configuration(format!("invalid namespace name: '{name}'")));
        }
        if name == keys::RESERVED_NAMESPACE {
            return Err(Error::Configuration("namespace name '_' is reserved".into()));
        }

        let ns_id = generate_id();
        let now = self.time.now_ms();

        let mut forward = Item::new();
        forward.insert(ATTR_NS_ID.into(), AttrValue::S(ns_id.clone()));
        forward.insert(ATTR_CREATED.into(), AttrValue::N(now));
        forward.insert(ATTR_SCHEMA.into(), AttrValue::N(i64::from(SCHEMA_VERSION)));

        let mut reverse = Item::new();
        reverse.insert(ATTR_NAME.into(), AttrValue::S(name.to_owned()));
        reverse.insert(ATTR_CREATED.into(), AttrValue::N(now));

        let registered = self
            .repo
            .register_namespace(
                (keys::namespace_forward(name), forward),
                (keys::namespace_reverse(&ns_id), reverse),
            )
            .await?;
        if !registered {
            return Err(Error::Configuration(format!(
                "namespace '{name}' is already registered"
            )));
        }
        tracing::debug!(name, ns_id = %ns_id, "registered namespace");
        Ok(ns_id)
    }

    /// Resolves a name to its namespace id. Soft-deleted names resolve
    /// to `None`.
    pub async fn lookup(&self, name: &str) -> Result<Option<String>> {
        let Some(item) = self.repo.get_raw(&keys::namespace_forward(name)).await? else {
            return Ok(None);
        };
        if let Some(schema) = get_n(&item, ATTR_SCHEMA) {
            let actual = u32::try_from(schema).unwrap_or(u32::MAX);
            if actual > SCHEMA_VERSION {
                return Err(Error::VersionMismatch { expected: SCHEMA_VERSION, actual });
            }
        }
        if get_bool(&item, ATTR_DELETED).unwrap_or(false) {
            return Ok(None);
        }
        Ok(get_s(&item, ATTR_NS_ID).map(str::to_owned))
    }

    /// Resolves a namespace id back to its registered name.
    pub async fn name_of(&self, ns_id: &str) -> Result<Option<String>> {
        let Some(item) = self.repo.get_raw(&keys::namespace_reverse(ns_id)).await? else {
            return Ok(None);
        };
        Ok(get_s(&item, ATTR_NAME).map(str::to_owned))
    }

    /// Soft-deletes a name: lookups stop resolving, data stays in place
    /// until [`purge`](Self::purge).
    pub async fn soft_delete(&self, name: &str) -> Result<()> {
        let ns_id = self.registered_id(name).await?;
        let deleted = vec![(ATTR_DELETED.to_owned(), AttrValue::Bool(true))];
        self.repo
            .set_attrs(&keys::namespace_forward(name), deleted.clone())
            .await?;
        self.repo
            .set_attrs(&keys::namespace_reverse(&ns_id), deleted)
            .await?;
        Ok(())
    }

    /// Removes every record under a soft-deleted namespace, then the
    /// registry entries themselves. Returns how many data items were
    /// purged.
    pub async fn purge(&self, name: &str) -> Result<usize> {
        let ns_id = self.registered_id(name).await?;
        let forward = self
            .repo
            .get_raw(&keys::namespace_forward(name))
            .await?
            .unwrap_or_default();
        if !get_bool(&forward, ATTR_DELETED).unwrap_or(false) {
            return Err(Error::Configuration(format!(
                "namespace '{name}' must be soft-deleted before purge"
            )));
        }

        let purged = self
            .repo
            .purge_pk_prefix(&keys::namespace_pk_prefix(&ns_id))
            .await?;
        self.repo.delete_raw(&keys::namespace_forward(name)).await?;
        self.repo.delete_raw(&keys::namespace_reverse(&ns_id)).await?;
        tracing::debug!(name, ns_id = %ns_id, purged, "purged namespace");
        Ok(purged)
    }

    async fn registered_id(&self, name: &str) -> Result<String> {
        let item = self
            .repo
            .get_raw(&keys::namespace_forward(name))
            .await?
            .ok_or_else(|| Error::Configuration(format!("namespace '{name}' is not registered")))?;
        get_s(&item, ATTR_NS_ID)
            .map(str::to_owned)
            .ok_or_else(|| Error::Internal(format!("registry record for '{name}' missing id")))
    }
}

/// An opaque 11-character alphanumeric namespace id.
fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAMESPACE_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_generates_opaque_ids() {
        let id = generate_id();
        assert_eq!(id.len(), NAMESPACE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_id(), generate_id());
    }
}
