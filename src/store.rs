//! The keyed-store contract.
//!
//! The limiter coordinates all state through a store that provides keyed
//! items, conditional updates with commutative ADD semantics, atomic
//! multi-item transactions, per-item TTL, and an ordered change feed with
//! old and new images. This module defines that contract; adapters for
//! concrete products implement [`Store`], and [`MemoryStore`] is the
//! in-process reference implementation.
//!
//! Adapters advertise what they support through [`Capabilities`]. The
//! repository degrades gracefully around missing capabilities: no batch
//! reads means sequential config resolution, no transactions means the
//! cascade write pair loses cross-item atomicity and relies on
//! compensation instead.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::keys::ItemKey;

#[cfg(feature = "memory-store")]
pub mod memory;

#[cfg(feature = "memory-store")]
pub use memory::MemoryStore;

/// A single attribute value.
///
/// Only the shapes the limiter persists: integers (all counters and
/// timestamps), strings, booleans, and flat string maps (entity metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// An integer. Every numeric attribute in the schema is an integer;
    /// fractions are carried as millitokens.
    N(i64),

    /// A string.
    S(String),

    /// A boolean.
    Bool(bool),

    /// A flat string-to-string map.
    M(HashMap<String, String>),
}

impl AttrValue {
    /// The integer value, if this is an [`AttrValue::N`].
    #[inline]
    pub fn as_n(&self) -> Option<i64> {
        match self {
            AttrValue::N(n) => Some(*n),
            _ => None,
        }
    }

    /// The string value, if this is an [`AttrValue::S`].
    #[inline]
    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean value, if this is an [`AttrValue::Bool`].
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The map value, if this is an [`AttrValue::M`].
    #[inline]
    pub fn as_map(&self) -> Option<&HashMap<String, String>> {
        match self {
            AttrValue::M(m) => Some(m),
            _ => None,
        }
    }
}

/// A stored item: attribute name → value.
pub type Item = HashMap<String, AttrValue>;

/// Reads an integer attribute off an item.
#[inline]
pub fn get_n(item: &Item, attr: &str) -> Option<i64> {
    item.get(attr).and_then(AttrValue::as_n)
}

/// Reads a string attribute off an item.
#[inline]
pub fn get_s<'a>(item: &'a Item, attr: &str) -> Option<&'a str> {
    item.get(attr).and_then(AttrValue::as_s)
}

/// Reads a boolean attribute off an item.
#[inline]
pub fn get_bool(item: &Item, attr: &str) -> Option<bool> {
    item.get(attr).and_then(AttrValue::as_bool)
}

/// A condition guarding a write.
///
/// Conditions are evaluated atomically against the item's current state;
/// a failed condition rejects the write and, when the update requested
/// [`ReturnValues::AllOld`], surfaces the pre-write image.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The item exists.
    Exists,

    /// The item does not exist.
    NotExists,

    /// The named attribute exists, is an integer, and is `>=` the bound.
    /// A missing attribute fails the comparison.
    Ge(String, i64),

    /// The named attribute exists, is an integer, and is `<` the bound.
    /// A missing attribute fails the comparison.
    Lt(String, i64),

    /// The named attribute equals the value exactly.
    Eq(String, AttrValue),

    /// The named attribute is absent. An absent item counts as absent.
    Missing(String),

    /// Every sub-condition holds.
    All(Vec<Condition>),

    /// At least one sub-condition holds.
    Any(Vec<Condition>),
}

impl Condition {
    /// Evaluates the condition against an item's current state.
    pub fn eval(&self, item: Option<&Item>) -> bool {
        match self {
            Condition::Exists => item.is_some(),
            Condition::NotExists => item.is_none(),
            Condition::Ge(attr, bound) => {
                item.and_then(|i| get_n(i, attr)).is_some_and(|n| n >= *bound)
            }
            Condition::Lt(attr, bound) => {
                item.and_then(|i| get_n(i, attr)).is_some_and(|n| n < *bound)
            }
            Condition::Eq(attr, value) => {
                item.and_then(|i| i.get(attr)).is_some_and(|v| v == value)
            }
            Condition::Missing(attr) => item.map_or(true, |i| !i.contains_key(attr)),
            Condition::All(conds) => conds.iter().all(|c| c.eval(item)),
            Condition::Any(conds) => conds.iter().any(|c| c.eval(item)),
        }
    }
}

/// Which image a conditional update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    /// No image.
    #[default]
    None,

    /// The pre-write image — on success and inside
    /// [`StoreError::ConditionFailed`] on rejection.
    AllOld,

    /// The post-write image on success; the pre-write image on rejection.
    AllNew,
}

/// A single-item update: commutative ADDs, SETs, an optional guard.
///
/// ADD is numeric addition that treats a missing attribute as zero and
/// creates the item if absent; it commutes with every other ADD, which is
/// what makes adjustments and rollbacks safe to issue unconditionally and
/// out of order.
#[derive(Debug, Clone)]
pub struct Update {
    /// The item to update.
    pub key: ItemKey,

    /// Attribute increments, applied after `condition` passes.
    pub adds: Vec<(String, i64)>,

    /// Attribute assignments, applied after `condition` passes.
    pub sets: Vec<(String, AttrValue)>,

    /// Optional write guard.
    pub condition: Option<Condition>,

    /// Which image to return.
    pub return_values: ReturnValues,
}

impl Update {
    /// Creates an empty update for the item.
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            adds: Vec::new(),
            sets: Vec::new(),
            condition: None,
            return_values: ReturnValues::None,
        }
    }

    /// Appends an ADD action.
    pub fn add(mut self, attr: impl Into<String>, delta: i64) -> Self {
        self.adds.push((attr.into(), delta));
        self
    }

    /// Appends a SET action.
    pub fn set(mut self, attr: impl Into<String>, value: AttrValue) -> Self {
        self.sets.push((attr.into(), value));
        self
    }

    /// Guards the update with a condition.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Selects which image the update returns.
    pub fn returning(mut self, rv: ReturnValues) -> Self {
        self.return_values = rv;
        self
    }
}

/// One entry of the store's ordered change feed.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Monotonic sequence number, unique across the feed.
    pub sequence: u64,

    /// The mutated item's key.
    pub key: ItemKey,

    /// Image before the mutation; `None` for creations.
    pub old: Option<Item>,

    /// Image after the mutation; `None` for deletions.
    pub new: Option<Item>,
}

/// What a [`Store`] adapter supports.
///
/// Every flag the adapter lacks has a documented degradation in the
/// repository layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Multi-key reads in one round trip.
    pub batch_operations: bool,

    /// Atomic multi-item conditional writes.
    pub transactions: bool,

    /// An ordered mutation feed with old and new images.
    pub change_feed: bool,
}

/// Errors surfaced by a [`Store`] adapter.
#[derive(Debug)]
pub enum StoreError {
    /// A conditional write was rejected. Carries the pre-write image when
    /// the update asked for one.
    ConditionFailed {
        /// The pre-write image, present when requested via
        /// [`ReturnValues::AllOld`] or [`ReturnValues::AllNew`].
        item: Option<Item>,
    },

    /// A transaction was canceled because some member's condition failed.
    /// One entry per member, in order: the pre-write image of the failed
    /// members, `None` for members whose condition held.
    TransactionCanceled {
        reasons: Vec<Option<Item>>,
    },

    /// The store is unreachable or rejected the call. `transient` marks
    /// throttling and timeouts, which are safe to retry.
    Unavailable {
        message: String,
        transient: bool,
    },

    /// The adapter does not implement this operation; consult
    /// [`Capabilities`] before calling.
    Unsupported(&'static str),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConditionFailed { .. } => write!(f, "conditional write rejected"),
            StoreError::TransactionCanceled { reasons } => {
                write!(f, "transaction canceled ({} members)", reasons.len())
            }
            StoreError::Unavailable { message, transient } => {
                let kind = if *transient { "transient" } else { "hard" };
                write!(f, "store unavailable ({kind}): {message}")
            }
            StoreError::Unsupported(op) => write!(f, "operation not supported by adapter: {op}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The contract a keyed store must satisfy to back the limiter.
///
/// All operations are linearizable per item: conditional writes observe a
/// consistent current image, and ADDs from concurrent writers compose.
pub trait Store: Send + Sync + 'static {
    /// What this adapter supports.
    fn capabilities(&self) -> Capabilities;

    /// Reads one item.
    fn get_item(
        &self,
        key: &ItemKey,
    ) -> impl Future<Output = Result<Option<Item>, StoreError>> + Send;

    /// Reads many items in one round trip, in key order. Requires
    /// [`Capabilities::batch_operations`].
    fn batch_get(
        &self,
        keys: &[ItemKey],
    ) -> impl Future<Output = Result<Vec<Option<Item>>, StoreError>> + Send;

    /// Writes a full item, optionally guarded.
    fn put_item(
        &self,
        key: &ItemKey,
        item: Item,
        condition: Option<Condition>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Applies a single-item update atomically.
    fn update_item(
        &self,
        update: Update,
    ) -> impl Future<Output = Result<Option<Item>, StoreError>> + Send;

    /// Applies several updates atomically: either every member's condition
    /// holds and all apply, or none do. Requires
    /// [`Capabilities::transactions`].
    fn transact(
        &self,
        updates: Vec<Update>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Deletes one item. Deleting an absent item is not an error.
    fn delete_item(&self, key: &ItemKey) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Lists items of one partition whose sort key starts with a prefix.
    fn query_prefix(
        &self,
        pk: &str,
        sk_prefix: &str,
    ) -> impl Future<Output = Result<Vec<(ItemKey, Item)>, StoreError>> + Send;

    /// Lists the keys of every item whose partition key starts with a
    /// prefix. Backs discovery and purge; products without a native scan
    /// build this from a secondary index.
    fn scan_pk_prefix(
        &self,
        pk_prefix: &str,
    ) -> impl Future<Output = Result<Vec<ItemKey>, StoreError>> + Send;

    /// Reads change-feed records with `sequence > cursor`, oldest first,
    /// at most `max`. Requires [`Capabilities::change_feed`].
    fn poll_changes(
        &self,
        cursor: u64,
        max: usize,
    ) -> impl Future<Output = Result<Vec<ChangeRecord>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(attrs: &[(&str, i64)]) -> Item {
        attrs.iter().map(|(k, v)| (k.to_string(), AttrValue::N(*v))).collect()
    }

    #[test]
    fn it_evaluates_existence_conditions() {
        let it = item(&[("tk", 5)]);
        assert!(Condition::Exists.eval(Some(&it)));
        assert!(!Condition::Exists.eval(None));
        assert!(Condition::NotExists.eval(None));
        assert!(!Condition::NotExists.eval(Some(&it)));
    }

    #[test]
    fn it_fails_comparisons_on_missing_attributes() {
        let it = item(&[("tk", 5)]);
        assert!(Condition::Ge("tk".into(), 5).eval(Some(&it)));
        assert!(!Condition::Ge("tk".into(), 6).eval(Some(&it)));
        assert!(!Condition::Ge("other".into(), 0).eval(Some(&it)));
        assert!(!Condition::Lt("other".into(), 100).eval(Some(&it)));
        assert!(!Condition::Ge("tk".into(), 0).eval(None));
    }

    #[test]
    fn it_treats_absent_items_as_missing_attributes() {
        let it = item(&[("tk", 5)]);
        assert!(Condition::Missing("shard_count".into()).eval(None));
        assert!(Condition::Missing("shard_count".into()).eval(Some(&it)));
        assert!(!Condition::Missing("tk".into()).eval(Some(&it)));
    }

    #[test]
    fn it_combines_conditions() {
        let it = item(&[("tk", 5), ("shard_count", 2)]);

        let all = Condition::All(vec![
            Condition::Exists,
            Condition::Ge("tk".into(), 1),
        ]);
        assert!(all.eval(Some(&it)));

        // Propagation guard: shard_count lower than the new value or missing.
        let any = Condition::Any(vec![
            Condition::Missing("shard_count".into()),
            Condition::Lt("shard_count".into(), 4),
        ]);
        assert!(any.eval(Some(&it)));
        assert!(any.eval(None));

        let any = Condition::Any(vec![
            Condition::Missing("shard_count".into()),
            Condition::Lt("shard_count".into(), 2),
        ]);
        assert!(!any.eval(Some(&it)));
    }

    #[test]
    fn it_builds_updates_fluently() {
        let update = Update::new(ItemKey::new("ns/BUCKET#e#r#0", "#STATE"))
            .add("b_rpm_tk", -1_000)
            .add("b_rpm_tc", 1_000)
            .set("rf", AttrValue::N(42))
            .condition(Condition::Ge("b_rpm_tk".into(), 1_000))
            .returning(ReturnValues::AllOld);

        assert_eq!(update.adds.len(), 2);
        assert_eq!(update.sets.len(), 1);
        assert!(update.condition.is_some());
        assert_eq!(update.return_values, ReturnValues::AllOld);
    }
}
