//! Composite bucket records and shard arithmetic.
//!
//! One bucket record exists per (namespace, entity, resource, shard) and
//! holds three counters for every limit present — balance `tk`, capacity
//! `cp`, net consumption `tc` — plus one shared refill timestamp. The
//! record also denormalizes the entity's `cascade`, `parent_id`, and the
//! current `shard_count`, so the speculative acquire path never needs a
//! separate metadata read.
//!
//! Sharding divides a user-facing limit across `shard_count` records on
//! distinct partitions: each shard carries `cp / shard_count` capacity and
//! `ra / shard_count` refill, so the sum across shards equals the
//! configured limit. The reserved `wcu` limit is the exception — it tracks
//! *per-partition* write pressure and is never divided.

use rand::Rng;

use crate::error::{Error, Result};
use crate::keys::{
    self, ATTR_CASCADE, ATTR_PARENT, ATTR_REFILL, ATTR_SHARD_COUNT, BucketCol, ItemKey,
};
use crate::limits::{Limit, LimitName, LimitSet};
use crate::store::{AttrValue, Item, get_bool, get_n, get_s};

/// Counter triple for one limit on one shard. All values millitokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LimitCounters {
    /// Current balance. Negative means debt.
    pub tokens: i64,

    /// Shard-effective capacity. Immutable except on reshard.
    pub capacity: i64,

    /// Net consumption. Monotone except for rollback compensation.
    pub consumed: i64,
}

/// A decoded bucket shard record.
#[derive(Debug, Clone)]
pub(crate) struct BucketState {
    pub namespace: String,
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
    pub limits: indexmap::IndexMap<LimitName, LimitCounters>,
    pub last_refill_ms: i64,
    pub cascade: bool,
    pub parent_id: Option<String>,
    pub shard_count: u32,
}

impl BucketState {
    /// Decodes a bucket record from its key and stored item.
    pub(crate) fn decode(key: &ItemKey, item: &Item) -> Result<Self> {
        let bucket_ref = keys::parse_bucket_pk(&key.pk)
            .ok_or_else(|| Error::Internal(format!("malformed bucket key: {}", key.pk)))?;

        let mut limits = indexmap::IndexMap::new();
        for (attr, value) in item {
            let Some((limit, col)) = keys::parse_bucket_attr(attr) else {
                continue;
            };
            let n = value
                .as_n()
                .ok_or_else(|| Error::Internal(format!("non-integer bucket counter: {attr}")))?;
            let counters = limits
                .entry(LimitName::from(limit))
                .or_insert(LimitCounters { tokens: 0, capacity: 0, consumed: 0 });
            match col {
                BucketCol::Tokens => counters.tokens = n,
                BucketCol::Capacity => counters.capacity = n,
                BucketCol::Consumed => counters.consumed = n,
            }
        }

        Ok(Self {
            namespace: bucket_ref.namespace,
            entity_id: bucket_ref.entity_id,
            resource: bucket_ref.resource,
            shard: bucket_ref.shard,
            limits,
            last_refill_ms: get_n(item, ATTR_REFILL).unwrap_or_default(),
            cascade: get_bool(item, ATTR_CASCADE).unwrap_or_default(),
            parent_id: get_s(item, ATTR_PARENT).map(str::to_owned),
            shard_count: get_n(item, ATTR_SHARD_COUNT).and_then(|n| u32::try_from(n).ok()).unwrap_or(1),
        })
    }

    /// Counters of one limit, if present on this shard.
    #[inline]
    pub(crate) fn limit(&self, name: &LimitName) -> Option<&LimitCounters> {
        self.limits.get(name)
    }
}

/// Picks a shard uniformly at random. Across many acquires this divides
/// the per-(entity, resource) write rate by `shard_count`.
#[inline]
pub(crate) fn pick_shard(shard_count: u32) -> u32 {
    if shard_count <= 1 {
        return 0;
    }
    rand::thread_rng().gen_range(0..shard_count)
}

/// Shard-effective parameters of a limit: `(capacity, refill_amount)` in
/// millitokens. App limits are divided across shards; `wcu` tracks
/// per-partition pressure and keeps its full value on every shard.
#[inline]
pub(crate) fn shard_limit(limit: &Limit, shard_count: u32) -> (i64, i64) {
    if limit.name.is_reserved() || shard_count <= 1 {
        return (limit.capacity_milli, limit.refill_amount_milli);
    }
    let n = i64::from(shard_count);
    (limit.capacity_milli / n, limit.refill_amount_milli / n)
}

/// Builds the initial item for a bucket shard: every limit (plus `wcu`)
/// at full shard capacity minus the first consumption, the refill clock
/// stamped at `now`, and the entity data denormalized in.
pub(crate) fn initial_item(
    limits: &LimitSet,
    consumed_milli: &[(LimitName, i64)],
    now_ms: i64,
    cascade: bool,
    parent_id: Option<&str>,
    shard_count: u32,
) -> Item {
    let mut item = Item::new();
    for (name, limit) in limits {
        let (capacity, _) = shard_limit(limit, shard_count);
        let consumed = consumed_milli
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
            .unwrap_or_default();
        let name = name.as_str();
        item.insert(keys::bucket_attr(name, BucketCol::Tokens), AttrValue::N(capacity - consumed));
        item.insert(keys::bucket_attr(name, BucketCol::Capacity), AttrValue::N(capacity));
        item.insert(keys::bucket_attr(name, BucketCol::Consumed), AttrValue::N(consumed));
    }
    item.insert(ATTR_REFILL.into(), AttrValue::N(now_ms));
    item.insert(ATTR_CASCADE.into(), AttrValue::Bool(cascade));
    if let Some(parent) = parent_id {
        item.insert(ATTR_PARENT.into(), AttrValue::S(parent.to_owned()));
    }
    item.insert(ATTR_SHARD_COUNT.into(), AttrValue::N(i64::from(shard_count)));
    item
}
