//! The aggregator: proactive refills, resharding, and usage snapshots.
//!
//! A background process consumes the store's ordered change feed and
//! reconciles bucket state without ever blocking foreground acquires.
//! Every write it issues is either conditional — refills are locked on
//! the refill clock, reshards on the shard count — or commutative
//! (snapshot ADDs), which is what makes replaying a batch under
//! at-least-once delivery safe: a replayed conditional loses its guard
//! and is silently skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::bucket::{self, BucketState};
use crate::config::{self, ConfigCache, ConfigScope, DEFAULT_CONFIG_TTL, ResolvedConfig};
use crate::error::Result;
use crate::kernel::{self, SystemTimeSource, TimeSource};
use crate::keys::{self, ATTR_CONFIG_VERSION, BucketCol, ItemKey, SK_CONFIG};
use crate::lease::acquire::capacity_sets;
use crate::limits::{Limit, LimitName};
use crate::repository::{Repository, RetryPolicy};
use crate::store::{ChangeRecord, Item, Store, get_n};

/// Reshard when a batch consumes more than this share of shard 0's
/// write capacity.
const RESHARD_PRESSURE_NUM: i64 = 8;
const RESHARD_PRESSURE_DEN: i64 = 10;

/// Counters for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Change records consumed.
    pub records: usize,

    /// Refill writes applied.
    pub refills: usize,

    /// Refill writes skipped because a concurrent refill won the clock.
    pub refill_conflicts: usize,

    /// Shard-count doublings applied on shard 0.
    pub reshards: usize,

    /// Shard-count propagations applied to follower shards.
    pub propagations: usize,

    /// Usage snapshot windows updated.
    pub snapshot_updates: usize,

    /// Config cache entries invalidated from observed config writes.
    pub config_invalidations: usize,
}

/// A snapshot window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SnapshotWindow {
    /// Hourly windows, kept for seven days.
    Hour,

    /// Daily windows, kept for thirty-five days.
    Day,
}

impl SnapshotWindow {
    pub(crate) fn span_ms(self) -> i64 {
        match self {
            SnapshotWindow::Hour => 3_600_000,
            SnapshotWindow::Day => 86_400_000,
        }
    }

    pub(crate) fn ttl_ms(self) -> i64 {
        match self {
            SnapshotWindow::Hour => 7 * 86_400_000,
            SnapshotWindow::Day => 35 * 86_400_000,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            SnapshotWindow::Hour => "hour",
            SnapshotWindow::Day => "day",
        }
    }

    /// `hour#{start_ms}` / `day#{start_ms}`.
    pub(crate) fn window_key(self, start_ms: i64) -> String {
        format!("{}#{start_ms}", self.tag())
    }

    pub(crate) fn parse_key(key: &str) -> Option<(Self, i64)> {
        let (tag, start) = key.split_once('#')?;
        let window = match tag {
            "hour" => SnapshotWindow::Hour,
            "day" => SnapshotWindow::Day,
            _ => return None,
        };
        Some((window, start.parse().ok()?))
    }
}

/// One materialized usage window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageWindow {
    /// Window granularity.
    pub window: SnapshotWindow,

    /// Window start, epoch milliseconds.
    pub start_ms: i64,

    /// Net consumption folded into this window, millitokens per limit.
    pub consumed_milli: IndexMap<LimitName, i64>,
}

impl UsageWindow {
    pub(crate) fn decode(key: &ItemKey, item: &Item) -> Option<Self> {
        let window_key = key.sk.strip_prefix("#USAGE#")?.split_once('#')?.1;
        let (window, start_ms) = SnapshotWindow::parse_key(window_key)?;
        let mut consumed_milli = IndexMap::new();
        for (attr, value) in item {
            if let (Some(limit), Some(n)) = (keys::parse_usage_attr(attr), value.as_n()) {
                consumed_milli.insert(LimitName::from(limit), n);
            }
        }
        Some(Self { window, start_ms, consumed_milli })
    }
}

/// Everything observed about one bucket shard across a batch.
#[derive(Default)]
struct ShardActivity {
    /// Net `tc` movement per limit within the batch, millitokens.
    consumed: IndexMap<LimitName, i64>,

    /// Last post-mutation image; `None` once the shard was deleted.
    last: Option<Item>,

    /// Whether any record in the batch raised `shard_count`.
    raised_count: bool,
}

/// The background reconciler. Independent of any [`Limiter`] instance:
/// it is usually deployed as its own process, holding only a store
/// handle.
///
/// [`Limiter`]: crate::Limiter
pub struct Aggregator<S: Store> {
    repo: Repository<S>,
    configs: ConfigCache,
    time: Arc<dyn TimeSource>,
    poll_interval: Duration,
    batch_size: usize,
}

impl<S: Store> Aggregator<S> {
    /// Creates an aggregator over a store adapter.
    pub fn new(store: S) -> Self {
        let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
        Self {
            repo: Repository::new(store, RetryPolicy::default()),
            configs: ConfigCache::new(DEFAULT_CONFIG_TTL, time.clone()),
            time,
            poll_interval: Duration::from_millis(250),
            batch_size: 500,
        }
    }

    /// Overrides the clock. Intended for deterministic tests.
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.configs = ConfigCache::new(DEFAULT_CONFIG_TTL, time.clone());
        self.time = time;
        self
    }

    /// Overrides the feed poll cadence.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the per-poll batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Drives the change feed until cancelled. The cursor lives in
    /// memory; a restarted aggregator re-reads the feed from wherever the
    /// store's retention starts, which is safe because processing is
    /// idempotent.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut cursor = 0;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let batch = self.repo.poll_changes(cursor, self.batch_size).await?;
            let Some(last) = batch.last() else {
                continue;
            };
            cursor = last.sequence;
            match self.process_changes(&batch).await {
                Ok(stats) => {
                    tracing::debug!(?stats, "processed change batch");
                }
                Err(e) => {
                    // The records will come around again; at-least-once
                    // delivery plus idempotent writes make that safe.
                    tracing::warn!(error = %e, "change batch failed; will replay");
                }
            }
        }
    }

    /// Processes one batch of change records: aggregates bucket activity,
    /// issues proactive refills and reshards, propagates raised shard
    /// counts, and folds consumption into usage snapshots.
    pub async fn process_changes(&self, records: &[ChangeRecord]) -> Result<AggregatorStats> {
        let mut stats = AggregatorStats { records: records.len(), ..Default::default() };
        let mut shards: IndexMap<String, ShardActivity> = IndexMap::new();

        for record in records {
            if let Some(scope_ns) = config_scope_of(&record.key) {
                let version = record
                    .new
                    .as_ref()
                    .and_then(|i| get_n(i, ATTR_CONFIG_VERSION))
                    .unwrap_or(i64::MAX);
                self.configs.note_version(&scope_ns.1, &scope_ns.0, version);
                stats.config_invalidations += 1;
                continue;
            }
            if keys::parse_bucket_pk(&record.key.pk).is_none() {
                continue;
            }

            let activity = shards.entry(record.key.pk.clone()).or_default();
            for (name, delta) in tc_deltas(record) {
                *activity.consumed.entry(name).or_insert(0) += delta;
            }
            let old_count = record
                .old
                .as_ref()
                .map(|i| get_n(i, keys::ATTR_SHARD_COUNT).unwrap_or(1));
            let new_count = record
                .new
                .as_ref()
                .and_then(|i| get_n(i, keys::ATTR_SHARD_COUNT));
            if let (Some(old), Some(new)) = (old_count, new_count) {
                if new > old {
                    activity.raised_count = true;
                }
            }
            activity.last = record.new.clone();
        }

        let mut usage: HashMap<(String, String, String), IndexMap<LimitName, i64>> =
            HashMap::new();

        for (pk, activity) in &shards {
            let Some(last) = &activity.last else {
                continue;
            };
            let key = ItemKey::new(pk.clone(), keys::SK_STATE);
            let state = BucketState::decode(&key, last)?;
            let resolved = self.resolve(&state).await?;

            self.refill_shard(&key, &state, activity, resolved.as_deref(), &mut stats)
                .await?;

            if state.shard == 0 {
                self.reshard_under_pressure(&key, &state, activity, resolved.as_deref(), &mut stats)
                    .await?;
                self.propagate(&state, activity, resolved.as_deref(), &mut stats)
                    .await?;
            }

            let entry = usage
                .entry((state.namespace.clone(), state.entity_id.clone(), state.resource.clone()))
                .or_default();
            for (name, delta) in &activity.consumed {
                if *delta != 0 && !name.is_reserved() {
                    *entry.entry(name.clone()).or_insert(0) += delta;
                }
            }
        }

        self.materialize_snapshots(usage, &mut stats).await?;
        Ok(stats)
    }

    /// Issues a proactive refill when the post-refill balance would not
    /// sustain the consumption rate this batch showed. Locked on the
    /// refill clock: losing the race to anyone else is silently skipped.
    async fn refill_shard(
        &self,
        key: &ItemKey,
        state: &BucketState,
        activity: &ShardActivity,
        resolved: Option<&ResolvedConfig>,
        stats: &mut AggregatorStats,
    ) -> Result<()> {
        let now = self.time.now_ms();
        let wcu = Limit::wcu();
        let mut adds = Vec::new();

        for (name, counters) in &state.limits {
            let limit = if name.is_reserved() {
                &wcu
            } else {
                match resolved.and_then(|r| r.limits.get(name)) {
                    Some(limit) => limit,
                    None => continue,
                }
            };
            let (_, ra_s) = bucket::shard_limit(limit, state.shard_count);
            let (tokens, _) = kernel::refill(
                counters.tokens,
                state.last_refill_ms,
                now,
                counters.capacity,
                ra_s,
                limit.refill_period_ms,
            );
            let to_add = tokens - counters.tokens;
            let demand = activity.consumed.get(name).copied().unwrap_or_default();
            if to_add > 0 && tokens < demand {
                adds.push((keys::bucket_attr(name.as_str(), BucketCol::Tokens), to_add));
            }
        }

        if adds.is_empty() {
            return Ok(());
        }
        if self
            .repo
            .refill_bucket(key, adds, state.last_refill_ms, now)
            .await?
        {
            stats.refills += 1;
        } else {
            stats.refill_conflicts += 1;
        }
        Ok(())
    }

    /// Doubles shard 0's shard count when the batch burned more than the
    /// pressure threshold of its write capacity.
    async fn reshard_under_pressure(
        &self,
        key: &ItemKey,
        state: &BucketState,
        activity: &ShardActivity,
        resolved: Option<&ResolvedConfig>,
        stats: &mut AggregatorStats,
    ) -> Result<()> {
        let Some(resolved) = resolved else {
            return Ok(());
        };
        let wcu_burn = activity
            .consumed
            .get(&LimitName::Wcu)
            .copied()
            .unwrap_or_default();
        let capacity = state
            .limit(&LimitName::Wcu)
            .map_or(Limit::wcu().capacity_milli, |c| c.capacity);
        if wcu_burn * RESHARD_PRESSURE_DEN <= capacity * RESHARD_PRESSURE_NUM {
            return Ok(());
        }

        let new_count = state.shard_count.saturating_mul(2);
        let sets = capacity_sets(&resolved.limits, new_count);
        if self
            .repo
            .reshard(key, state.shard_count, new_count, sets)
            .await?
        {
            tracing::info!(
                entity = %state.entity_id,
                resource = %state.resource,
                new_count,
                "aggregator doubled shard count under write pressure"
            );
            stats.reshards += 1;
        }
        Ok(())
    }

    /// Pushes a raised shard count from shard 0 to the follower shards.
    /// Followers only ever move upward; the guard drops anything stale.
    async fn propagate(
        &self,
        state: &BucketState,
        activity: &ShardActivity,
        resolved: Option<&ResolvedConfig>,
        stats: &mut AggregatorStats,
    ) -> Result<()> {
        if !activity.raised_count {
            return Ok(());
        }
        let sets = resolved
            .map(|r| capacity_sets(&r.limits, state.shard_count))
            .unwrap_or_default();

        for shard in 1..state.shard_count {
            let key = keys::bucket(&state.namespace, &state.entity_id, &state.resource, shard);
            if self
                .repo
                .propagate_shard_count(&key, state.shard_count, sets.clone())
                .await?
            {
                stats.propagations += 1;
            }
        }
        Ok(())
    }

    /// Folds the batch's per-(entity, resource) consumption into hourly
    /// and daily windows with commutative ADDs.
    async fn materialize_snapshots(
        &self,
        usage: HashMap<(String, String, String), IndexMap<LimitName, i64>>,
        stats: &mut AggregatorStats,
    ) -> Result<()> {
        let now = self.time.now_ms();
        for ((ns, entity_id, resource), deltas) in usage {
            if deltas.is_empty() {
                continue;
            }
            let adds: Vec<(String, i64)> = deltas
                .iter()
                .map(|(name, delta)| (keys::usage_attr(name.as_str()), *delta))
                .collect();

            for window in [SnapshotWindow::Hour, SnapshotWindow::Day] {
                let start = now - now.rem_euclid(window.span_ms());
                let key = keys::usage(&ns, &entity_id, &resource, &window.window_key(start));
                self.repo
                    .add_usage(&key, adds.clone(), start + window.ttl_ms())
                    .await?;
                stats.snapshot_updates += 1;
            }
        }
        Ok(())
    }

    /// Cached config resolution keyed off the bucket's own namespace.
    async fn resolve(&self, state: &BucketState) -> Result<Option<Arc<ResolvedConfig>>> {
        if let Some(hit) = self
            .configs
            .get(&state.namespace, &state.entity_id, &state.resource)
        {
            return Ok(Some(hit));
        }
        let candidates = self
            .repo
            .fetch_config_candidates(&state.namespace, &state.entity_id, &state.resource)
            .await?;
        let refs = std::array::from_fn(|i| candidates[i].as_ref());
        match config::resolve(refs)? {
            Some(resolved) => {
                let resolved = Arc::new(resolved);
                self.configs
                    .insert(&state.namespace, &state.entity_id, &state.resource, resolved.clone());
                Ok(Some(resolved))
            }
            None => Ok(None),
        }
    }
}

/// Net `tc` movement per limit one change record represents.
fn tc_deltas(record: &ChangeRecord) -> Vec<(LimitName, i64)> {
    let mut deltas = Vec::new();
    let empty = Item::new();
    let new = record.new.as_ref().unwrap_or(&empty);
    let old = record.old.as_ref();

    for (attr, value) in new {
        let Some((limit, BucketCol::Consumed)) = keys::parse_bucket_attr(attr) else {
            continue;
        };
        let Some(n) = value.as_n() else {
            continue;
        };
        let before = old.and_then(|o| get_n(o, attr)).unwrap_or_default();
        if n != before {
            deltas.push((LimitName::from(limit), n - before));
        }
    }
    deltas
}

/// Identifies a config record's scope from its key, along with the
/// namespace, for cache invalidation.
fn config_scope_of(key: &ItemKey) -> Option<(ConfigScope, String)> {
    let (ns, rest) = key.pk.split_once('/')?;
    if key.sk == SK_CONFIG {
        if rest == "SYSTEM#" {
            return Some((ConfigScope::System, ns.to_owned()));
        }
        if let Some(resource) = rest.strip_prefix("RESOURCE#") {
            return Some((ConfigScope::Resource(resource.to_owned()), ns.to_owned()));
        }
        return None;
    }
    let resource = key.sk.strip_prefix("#CONFIG#")?;
    let entity_id = rest.strip_prefix("ENTITY#")?;
    let scope = if resource == keys::DEFAULT_RESOURCE {
        ConfigScope::EntityDefault(entity_id.to_owned())
    } else {
        ConfigScope::EntityResource {
            entity_id: entity_id.to_owned(),
            resource: resource.to_owned(),
        }
    };
    Some((scope, ns.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AttrValue;

    #[test]
    fn it_round_trips_window_keys() {
        let key = SnapshotWindow::Hour.window_key(3_600_000);
        assert_eq!(key, "hour#3600000");
        assert_eq!(SnapshotWindow::parse_key(&key), Some((SnapshotWindow::Hour, 3_600_000)));
        assert_eq!(
            SnapshotWindow::parse_key("day#86400000"),
            Some((SnapshotWindow::Day, 86_400_000))
        );
        assert!(SnapshotWindow::parse_key("week#0").is_none());
    }

    #[test]
    fn it_extracts_tc_deltas() {
        let key = keys::bucket("ns", "e", "r", 0);
        let mut old = Item::new();
        old.insert("b_rpm_tc".into(), AttrValue::N(5_000));
        old.insert("b_rpm_tk".into(), AttrValue::N(1_000));
        let mut new = old.clone();
        new.insert("b_rpm_tc".into(), AttrValue::N(8_000));
        new.insert("b_wcu_tc".into(), AttrValue::N(1_000));

        let record = ChangeRecord { sequence: 1, key, old: Some(old), new: Some(new) };
        let mut deltas = tc_deltas(&record);
        deltas.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        assert_eq!(deltas, vec![(LimitName::Rpm, 3_000), (LimitName::Wcu, 1_000)]);
    }

    #[test]
    fn it_identifies_config_scopes() {
        let (scope, ns) = config_scope_of(&keys::system_config("n1")).unwrap();
        assert_eq!(scope, ConfigScope::System);
        assert_eq!(ns, "n1");

        let (scope, _) = config_scope_of(&keys::resource_config("n1", "gpt")).unwrap();
        assert_eq!(scope, ConfigScope::Resource("gpt".into()));

        let (scope, _) = config_scope_of(&keys::entity_config("n1", "e", "gpt")).unwrap();
        assert_eq!(
            scope,
            ConfigScope::EntityResource { entity_id: "e".into(), resource: "gpt".into() }
        );

        let (scope, _) = config_scope_of(&keys::entity_default_config("n1", "e")).unwrap();
        assert_eq!(scope, ConfigScope::EntityDefault("e".into()));

        assert!(config_scope_of(&keys::entity_meta("n1", "e")).is_none());
        assert!(config_scope_of(&keys::bucket("n1", "e", "r", 0)).is_none());
    }

    #[test]
    fn it_decodes_usage_windows() {
        let key = keys::usage("ns", "e", "gpt", &SnapshotWindow::Hour.window_key(7_200_000));
        let mut item = Item::new();
        item.insert("u_rpm".into(), AttrValue::N(12_000));
        item.insert("ttl".into(), AttrValue::N(999));

        let window = UsageWindow::decode(&key, &item).unwrap();
        assert_eq!(window.window, SnapshotWindow::Hour);
        assert_eq!(window.start_ms, 7_200_000);
        assert_eq!(window.consumed_milli[&LimitName::Rpm], 12_000);
    }
}
