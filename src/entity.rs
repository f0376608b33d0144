//! Entities and the process-local metadata cache.
//!
//! An entity is the subject of rate limiting. Whether its consumption
//! cascades into a parent is declared once, at creation — it is a
//! property of the entity, never of an individual acquire, so a caller
//! cannot bypass hierarchical limits by picking different arguments.
//! `cascade` and `parent_id` are treated as immutable for a living
//! entity; changing them means delete and recreate.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::store::{AttrValue, Item, get_bool, get_n, get_s};

const ATTR_PARENT: &str = "parent_id";
const ATTR_CASCADE: &str = "cascade";
const ATTR_METADATA: &str = "metadata";
const ATTR_CREATED: &str = "created_ms";

/// A rate-limited subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Caller-chosen identifier, unique within the namespace.
    pub id: String,

    /// Optional parent entity for hierarchical limiting.
    pub parent_id: Option<String>,

    /// Whether every acquire on this entity also consumes from the
    /// parent. Meaningful only when `parent_id` is set.
    pub cascade: bool,

    /// Free-form descriptive attributes.
    pub metadata: HashMap<String, String>,

    /// Creation timestamp, epoch milliseconds.
    pub created_ms: i64,
}

impl Entity {
    /// Describes a new entity. Cascade and parent are fixed here for the
    /// entity's lifetime.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            cascade: false,
            metadata: HashMap::new(),
            created_ms: 0,
        }
    }

    /// Attaches a parent. `cascade` decides whether acquires on this
    /// entity also consume from the parent's buckets.
    pub fn with_parent(mut self, parent_id: impl Into<String>, cascade: bool) -> Self {
        self.parent_id = Some(parent_id.into());
        self.cascade = cascade;
        self
    }

    /// Adds one metadata attribute.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn encode(&self) -> Item {
        let mut item = Item::new();
        if let Some(parent) = &self.parent_id {
            item.insert(ATTR_PARENT.into(), AttrValue::S(parent.clone()));
        }
        item.insert(ATTR_CASCADE.into(), AttrValue::Bool(self.cascade));
        if !self.metadata.is_empty() {
            item.insert(ATTR_METADATA.into(), AttrValue::M(self.metadata.clone()));
        }
        item.insert(ATTR_CREATED.into(), AttrValue::N(self.created_ms));
        item
    }

    pub(crate) fn decode(id: &str, item: &Item) -> Result<Self> {
        let cascade = get_bool(item, ATTR_CASCADE)
            .ok_or_else(|| Error::Internal(format!("entity '{id}' record missing cascade flag")))?;
        Ok(Self {
            id: id.to_owned(),
            parent_id: get_s(item, ATTR_PARENT).map(str::to_owned),
            cascade,
            metadata: item
                .get(ATTR_METADATA)
                .and_then(AttrValue::as_map)
                .cloned()
                .unwrap_or_default(),
            created_ms: get_n(item, ATTR_CREATED).unwrap_or_default(),
        })
    }
}

/// The slice of entity state acquires need on the hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntityMeta {
    pub cascade: bool,
    pub parent_id: Option<String>,
}

/// Process-local cache of entity metadata and per-resource shard counts.
///
/// Populated from whatever the store hands back — an explicit metadata
/// read on the slow path, or the denormalized fields of a speculative
/// write's returned image — and it is what makes the warm parallel-cascade
/// path possible without a second read. Shard counts only move upward;
/// a lagging observation never shrinks one.
#[derive(Default)]
pub(crate) struct EntityCache {
    entries: DashMap<(String, String), CachedEntity>,
}

#[derive(Debug, Clone, Default)]
struct CachedEntity {
    meta: Option<EntityMeta>,
    shard_counts: HashMap<Arc<str>, u32>,
}

impl EntityCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Cached metadata, if this process has seen the entity before.
    pub(crate) fn meta(&self, ns: &str, entity_id: &str) -> Option<EntityMeta> {
        self.entries
            .get(&(ns.to_owned(), entity_id.to_owned()))
            .and_then(|e| e.meta.clone())
    }

    /// Records metadata observed from the store.
    pub(crate) fn store_meta(&self, ns: &str, entity_id: &str, meta: EntityMeta) {
        self.entries
            .entry((ns.to_owned(), entity_id.to_owned()))
            .or_default()
            .meta = Some(meta);
    }

    /// The last observed shard count for (entity, resource); 1 if never
    /// observed.
    pub(crate) fn shard_count(&self, ns: &str, entity_id: &str, resource: &str) -> u32 {
        self.entries
            .get(&(ns.to_owned(), entity_id.to_owned()))
            .and_then(|e| e.shard_counts.get(resource).copied())
            .unwrap_or(1)
    }

    /// Raises the observed shard count. Lower observations are ignored —
    /// other shards may lag behind shard 0 but never exceed it.
    pub(crate) fn note_shard_count(&self, ns: &str, entity_id: &str, resource: &str, count: u32) {
        let mut entry = self
            .entries
            .entry((ns.to_owned(), entity_id.to_owned()))
            .or_default();
        let current = entry.shard_counts.entry(resource.into()).or_insert(1);
        if count > *current {
            *current = count;
        }
    }

    /// Forgets an entity, e.g. after deletion.
    pub(crate) fn invalidate(&self, ns: &str, entity_id: &str) {
        self.entries.remove(&(ns.to_owned(), entity_id.to_owned()));
    }
}
