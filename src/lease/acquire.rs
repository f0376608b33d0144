//! Acquire flows: slow path, speculative fast path, and cascade handling.
//!
//! Every flow upholds the same two guarantees:
//!
//! - *write-on-enter* — a lease is returned only after its consumption is
//!   durably written;
//! - *pre-write rejection* — a `RateLimitExceeded` is decided before any
//!   write is accepted for that call, so a rejection never leaves a
//!   phantom debit behind.
//!
//! The slow path reads, decides with the arithmetic kernel, then writes
//! under a guard. The speculative path skips the read and lets the store
//! decide admission through the write's own condition; its failure ladder
//! (fall back, reshard, retry another shard, fast-reject) is driven
//! entirely by the pre-write image a rejected conditional returns.

use std::sync::Arc;

use futures_util::future;

use crate::bucket::{self, BucketState};
use crate::config::ResolvedConfig;
use crate::entity::EntityMeta;
use crate::error::{Error, ExceededLimit, Result};
use crate::kernel::{self, MILLI};
use crate::keys::{self, ATTR_REFILL, BucketCol, ItemKey};
use crate::lease::{Lease, LeaseWrite};
use crate::limiter::Core;
use crate::limits::{Limit, LimitName, LimitSet, WCU_COST_MILLI};
use crate::repository::{PairOutcome, WriteOutcome};
use crate::store::{AttrValue, Condition, Item, ReturnValues, Store, Update};

/// Bounded retries for contended slow-path writes.
const SLOW_PATH_ATTEMPTS: u32 = 4;

/// Extra shards a speculative write tries after an exhausted one.
const SPECULATIVE_SHARD_RETRIES: u32 = 2;

/// One acquire in flight: what to consume, against which resolution.
pub(crate) struct AcquireRun<'a, S: Store> {
    pub core: &'a Arc<Core<S>>,
    pub entity_id: &'a str,
    pub resource: &'a str,
    /// App-limit consumption in millitokens, validated against `config`.
    pub consume_milli: Vec<(LimitName, i64)>,
    pub config: Arc<ResolvedConfig>,
}

impl<'a, S: Store> AcquireRun<'a, S> {
    fn ns(&self) -> &str {
        &self.core.ns
    }

    fn now(&self) -> i64 {
        self.core.time.now_ms()
    }

    fn child_key(&self, shard: u32) -> ItemKey {
        keys::bucket(self.ns(), self.entity_id, self.resource, shard)
    }

    fn parent_key(&self, parent_id: &str, shard: u32) -> ItemKey {
        keys::bucket(self.ns(), parent_id, self.resource, shard)
    }

    /// Entry point: dispatches on the limiter's speculation flag.
    pub(crate) async fn acquire(self) -> Result<Lease<S>> {
        if self.core.speculate {
            self.speculative().await
        } else {
            self.slow().await
        }
    }

    // --- slow path (read, decide, guarded write) ------------------------

    async fn slow(&self) -> Result<Lease<S>> {
        let meta = self.entity_meta().await?;
        let cascade_parent = match (&meta.parent_id, meta.cascade) {
            (Some(parent), true) => Some(parent.clone()),
            _ => None,
        };

        if let Some(parent_id) = &cascade_parent {
            // The parent must exist before anything is written anywhere.
            if self.core.entities.meta(self.ns(), parent_id).is_none() {
                let parent = self
                    .core
                    .repo
                    .get_entity(self.ns(), parent_id)
                    .await?
                    .ok_or_else(|| Error::ParentNotFound(parent_id.clone()))?;
                self.core.entities.store_meta(
                    self.ns(),
                    parent_id,
                    EntityMeta { cascade: parent.cascade, parent_id: parent.parent_id },
                );
            }
        }

        for _ in 0..SLOW_PATH_ATTEMPTS {
            match &cascade_parent {
                None => {
                    if let Some(lease) = self.slow_single(&meta).await? {
                        return Ok(lease);
                    }
                }
                Some(parent_id) => {
                    if let Some(lease) = self.slow_cascade(&meta, parent_id).await? {
                        return Ok(lease);
                    }
                }
            }
        }
        Err(Error::Internal(format!(
            "bucket for entity '{}' too contended to acquire",
            self.entity_id
        )))
    }

    /// One slow-path attempt without a parent. `None` asks the caller to
    /// retry with a fresh read.
    async fn slow_single(&self, meta: &EntityMeta) -> Result<Option<Lease<S>>> {
        let shard_count = self.cached_shard_count(self.entity_id);
        let shard = bucket::pick_shard(shard_count);
        let key = self.child_key(shard);

        let Some(item) = self.core.repo.read_bucket(&key).await? else {
            return self.create_with_consumption(&key, meta, shard_count).await;
        };

        let state = BucketState::decode(&key, &item)?;
        self.note_shards(self.entity_id, &state);

        let plan = plan_consume(&state, &self.config.limits, &self.consume_milli, self.now());
        if !plan.rejections.is_empty() {
            return Err(Error::exceeded(plan.rejections));
        }
        if let Some(retry_after_ms) = plan.wcu_retry_after_ms {
            self.reshard_for_pressure(state.shard_count).await?;
            return self.wcu_backpressure(retry_after_ms);
        }

        let consumption = plan.consumption.clone();
        match self.core.repo.guarded_update(plan.into_update(&key)).await? {
            WriteOutcome::Applied { .. } => Ok(Some(Lease::new(
                self.core.clone(),
                self.entity_id.to_owned(),
                self.resource.to_owned(),
                vec![LeaseWrite { key, deltas: consumption }],
            ))),
            WriteOutcome::Rejected { .. } => Ok(None),
        }
    }

    /// One slow-path attempt with a cascading parent: both buckets are
    /// materialized, both decisions are taken in memory, and the two
    /// guarded writes go through one atomic pair.
    async fn slow_cascade(&self, meta: &EntityMeta, parent_id: &str) -> Result<Option<Lease<S>>> {
        let child_count = self.cached_shard_count(self.entity_id);
        let parent_count = self.cached_shard_count(parent_id);
        let child_key = self.child_key(bucket::pick_shard(child_count));
        let parent_key = self.parent_key(parent_id, bucket::pick_shard(parent_count));

        let images = self
            .core
            .repo
            .read_buckets(&[child_key.clone(), parent_key.clone()])
            .await?;
        let [child_item, parent_item]: [Option<Item>; 2] = images
            .try_into()
            .map_err(|_| Error::Internal("batch read shape mismatch".into()))?;

        // Materialize missing buckets with zero consumption, then retry so
        // the consumption itself goes through the atomic pair.
        if child_item.is_none() {
            let item = bucket::initial_item(
                &with_wcu(&self.config.limits),
                &[],
                self.now(),
                true,
                Some(parent_id),
                child_count,
            );
            self.core.repo.create_bucket(&child_key, item).await?;
            return Ok(None);
        }
        if parent_item.is_none() {
            let parent_limits = self.parent_limits(parent_id).await?;
            let parent_meta = self.core.entities.meta(self.ns(), parent_id);
            let item = bucket::initial_item(
                &with_wcu(&parent_limits),
                &[],
                self.now(),
                parent_meta.as_ref().map_or(false, |m| m.cascade),
                parent_meta.as_ref().and_then(|m| m.parent_id.as_deref()),
                parent_count,
            );
            self.core.repo.create_bucket(&parent_key, item).await?;
            return Ok(None);
        }

        let child_state = BucketState::decode(&child_key, &child_item.unwrap_or_default())?;
        let parent_state = BucketState::decode(&parent_key, &parent_item.unwrap_or_default())?;
        self.note_shards(self.entity_id, &child_state);
        self.note_shards(parent_id, &parent_state);

        let now = self.now();
        let parent_limits = self.parent_limits(parent_id).await?;
        let child_plan = plan_consume(&child_state, &self.config.limits, &self.consume_milli, now);
        let parent_plan = plan_consume(&parent_state, &parent_limits, &self.consume_milli, now);

        let mut rejections = child_plan.rejections.clone();
        rejections.extend(parent_plan.rejections.clone());
        if !rejections.is_empty() {
            return Err(Error::exceeded(rejections));
        }
        if let Some(retry_after_ms) = child_plan.wcu_retry_after_ms {
            self.reshard_for_pressure(child_state.shard_count).await?;
            return self.wcu_backpressure(retry_after_ms);
        }
        if let Some(retry_after_ms) = parent_plan.wcu_retry_after_ms {
            return self.wcu_backpressure(retry_after_ms);
        }

        let child_consumption = child_plan.consumption.clone();
        let parent_consumption = parent_plan.consumption.clone();
        let outcome = self
            .core
            .repo
            .transact_pair(
                child_plan.into_update(&child_key),
                parent_plan.into_update(&parent_key),
                &child_consumption,
            )
            .await?;

        match outcome {
            PairOutcome::Applied => Ok(Some(Lease::new(
                self.core.clone(),
                self.entity_id.to_owned(),
                self.resource.to_owned(),
                vec![
                    LeaseWrite { key: child_key, deltas: child_consumption },
                    LeaseWrite { key: parent_key, deltas: parent_consumption },
                ],
            ))),
            PairOutcome::Canceled { .. } => Ok(None),
        }
    }

    /// First write of a bucket shard: the initial image carries the full
    /// shard capacity minus this acquire's consumption. `None` means a
    /// concurrent writer created the bucket first — retry and extend it.
    async fn create_with_consumption(
        &self,
        key: &ItemKey,
        meta: &EntityMeta,
        shard_count: u32,
    ) -> Result<Option<Lease<S>>> {
        let mut consumed = self.consume_milli.clone();
        consumed.push((LimitName::Wcu, WCU_COST_MILLI));

        // A fresh shard holds its full capacity; admission only fails if
        // the request exceeds the shard's capacity outright.
        let mut rejections = Vec::new();
        for (name, need) in &self.consume_milli {
            let limit = &self.config.limits[name];
            let (cp, ra) = bucket::shard_limit(limit, shard_count);
            if cp < *need {
                rejections.push(ExceededLimit {
                    name: name.clone(),
                    deficit_milli: need - cp,
                    retry_after_ms: kernel::retry_after_ms(need - cp, ra, limit.refill_period_ms),
                });
            }
        }
        if !rejections.is_empty() {
            return Err(Error::exceeded(rejections));
        }

        let item = bucket::initial_item(
            &with_wcu(&self.config.limits),
            &consumed,
            self.now(),
            meta.cascade,
            meta.parent_id.as_deref(),
            shard_count,
        );
        if !self.core.repo.create_bucket(key, item).await? {
            return Ok(None);
        }

        let deltas = consumption_deltas(&consumed);
        Ok(Some(Lease::new(
            self.core.clone(),
            self.entity_id.to_owned(),
            self.resource.to_owned(),
            vec![LeaseWrite { key: key.clone(), deltas }],
        )))
    }

    // --- speculative fast path (write first) ----------------------------

    async fn speculative(&self) -> Result<Lease<S>> {
        match self.core.entities.meta(self.ns(), self.entity_id) {
            None => self.speculative_cold().await,
            Some(meta) => self.speculative_warm(meta).await,
        }
    }

    /// Cold entity: nothing cached, so the conditional write goes to
    /// shard 0 and the returned image seeds the metadata cache.
    async fn speculative_cold(&self) -> Result<Lease<S>> {
        let key = self.child_key(0);
        match self.core.repo.guarded_update(self.speculative_update(&key)).await? {
            WriteOutcome::Applied { image } => {
                let state = BucketState::decode(&key, &image.unwrap_or_default())?;
                self.core.entities.store_meta(
                    self.ns(),
                    self.entity_id,
                    EntityMeta { cascade: state.cascade, parent_id: state.parent_id.clone() },
                );
                self.note_shards(self.entity_id, &state);

                let child = LeaseWrite {
                    key,
                    deltas: consumption_deltas(&self.with_wcu_consumption()),
                };
                match (&state.parent_id, state.cascade) {
                    (Some(parent_id), true) => {
                        self.speculative_parent_leg(child, &parent_id.clone()).await
                    }
                    _ => Ok(self.lease(vec![child])),
                }
            }
            WriteOutcome::Rejected { old } => self.child_failure(old, 0).await,
        }
    }

    /// Warm entity: cached metadata selects the shard and, for cascading
    /// entities, lets the child and parent writes fly in parallel.
    async fn speculative_warm(&self, meta: EntityMeta) -> Result<Lease<S>> {
        let child_count = self.cached_shard_count(self.entity_id);
        let shard = bucket::pick_shard(child_count);
        let child_key = self.child_key(shard);

        let parent_id = match (&meta.parent_id, meta.cascade) {
            (Some(parent), true) => parent.clone(),
            _ => {
                // No cascade: a single conditional write decides admission.
                return match self
                    .core
                    .repo
                    .guarded_update(self.speculative_update(&child_key))
                    .await?
                {
                    WriteOutcome::Applied { image } => {
                        if let Ok(state) = BucketState::decode(&child_key, &image.unwrap_or_default()) {
                            self.note_shards(self.entity_id, &state);
                        }
                        let deltas = consumption_deltas(&self.with_wcu_consumption());
                        Ok(self.lease(vec![LeaseWrite { key: child_key, deltas }]))
                    }
                    WriteOutcome::Rejected { old } => self.child_failure(old, shard).await,
                };
            }
        };

        let parent_key =
            self.parent_key(&parent_id, bucket::pick_shard(self.cached_shard_count(&parent_id)));
        let (child_out, parent_out) = future::join(
            self.core.repo.guarded_update(self.speculative_update(&child_key)),
            self.core.repo.guarded_update(self.speculative_update(&parent_key)),
        )
        .await;

        let consumption = consumption_deltas(&self.with_wcu_consumption());

        // A hard failure on one leg while the other leg's debit landed
        // would leak budget: undo the landed half before propagating.
        let (child_out, parent_out) = match (child_out, parent_out) {
            (Ok(child), Ok(parent)) => (child, parent),
            (Err(e), Ok(WriteOutcome::Applied { .. })) => {
                self.core.repo.compensate(&parent_key, &consumption).await;
                return Err(e);
            }
            (Ok(WriteOutcome::Applied { .. }), Err(e)) => {
                self.core.repo.compensate(&child_key, &consumption).await;
                return Err(e);
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        match (child_out, parent_out) {
            (WriteOutcome::Applied { image }, WriteOutcome::Applied { .. }) => {
                if let Ok(state) = BucketState::decode(&child_key, &image.unwrap_or_default()) {
                    self.note_shards(self.entity_id, &state);
                }
                Ok(self.lease(vec![
                    LeaseWrite { key: child_key, deltas: consumption.clone() },
                    LeaseWrite { key: parent_key, deltas: consumption },
                ]))
            }
            (WriteOutcome::Applied { .. }, WriteOutcome::Rejected { old }) => {
                let child = LeaseWrite { key: child_key, deltas: consumption };
                self.deferred_parent(child, &parent_id, &parent_key, old).await
            }
            (WriteOutcome::Rejected { old }, WriteOutcome::Applied { .. }) => {
                // The parent's debit has no matching child debit: undo it,
                // then treat the child failure on its own.
                self.core.repo.compensate(&parent_key, &consumption).await;
                self.child_failure(old, shard).await
            }
            (WriteOutcome::Rejected { old }, WriteOutcome::Rejected { .. }) => {
                self.child_failure_terminal(old, &child_key)?;
                self.slow().await
            }
        }
    }

    /// Parent leg after a committed child write when no parallel write
    /// was in flight (the cold-entity cascade).
    async fn speculative_parent_leg(
        &self,
        child: LeaseWrite,
        parent_id: &str,
    ) -> Result<Lease<S>> {
        let parent_key =
            self.parent_key(parent_id, bucket::pick_shard(self.cached_shard_count(parent_id)));
        match self.core.repo.guarded_update(self.speculative_update(&parent_key)).await? {
            WriteOutcome::Applied { .. } => {
                let deltas = consumption_deltas(&self.with_wcu_consumption());
                Ok(self.lease(vec![child, LeaseWrite { key: parent_key, deltas }]))
            }
            WriteOutcome::Rejected { old } => {
                self.deferred_parent(child, parent_id, &parent_key, old).await
            }
        }
    }

    /// Deferred compensation: the child is committed, the parent is not.
    /// Compensating the child costs a write and forces a re-acquire, so
    /// it happens only once the parent is known to be unrecoverable on
    /// the fast path.
    async fn deferred_parent(
        &self,
        child: LeaseWrite,
        parent_id: &str,
        parent_key: &ItemKey,
        parent_old: Option<Item>,
    ) -> Result<Lease<S>> {
        let now = self.now();

        // Missing bucket or missing limit attribute: only the full slow
        // path can materialize what is absent.
        let Some(old) = parent_old else {
            return self.compensate_child_then_slow(child).await;
        };
        let state = BucketState::decode(parent_key, &old)?;
        self.note_shards(parent_id, &state);
        let parent_limits = self.parent_limits(parent_id).await?;
        if self
            .consume_milli
            .iter()
            .any(|(name, _)| state.limit(name).is_none() || !parent_limits.contains_key(name))
        {
            return self.compensate_child_then_slow(child).await;
        }

        // If refilling cannot cover the shortfall, this acquire is dead:
        // pay the compensation and reject fast.
        let offenders = self.hopeless_offenders(&state, &parent_limits, now);
        if !offenders.is_empty() {
            self.core.repo.compensate(&child.key, &child.deltas).await;
            return Err(Error::exceeded(offenders));
        }

        // Refill would help: a parent-only slow path keeps the committed
        // child write and settles just the parent.
        for _ in 0..SLOW_PATH_ATTEMPTS {
            let Some(item) = self.core.repo.read_bucket(parent_key).await? else {
                break;
            };
            let fresh = BucketState::decode(parent_key, &item)?;
            let plan = plan_consume(&fresh, &parent_limits, &self.consume_milli, self.now());
            if !plan.rejections.is_empty() || plan.wcu_retry_after_ms.is_some() {
                break;
            }
            let consumption = plan.consumption.clone();
            match self.core.repo.guarded_update(plan.into_update(parent_key)).await? {
                WriteOutcome::Applied { .. } => {
                    return Ok(self.lease(vec![
                        child,
                        LeaseWrite { key: parent_key.clone(), deltas: consumption },
                    ]));
                }
                WriteOutcome::Rejected { .. } => continue,
            }
        }

        self.compensate_child_then_slow(child).await
    }

    async fn compensate_child_then_slow(&self, child: LeaseWrite) -> Result<Lease<S>> {
        self.core.repo.compensate(&child.key, &child.deltas).await;
        self.slow().await
    }

    /// The failure ladder for a rejected speculative child write.
    async fn child_failure(&self, old: Option<Item>, shard: u32) -> Result<Lease<S>> {
        let Some(old) = old else {
            // No bucket yet: it must be created, which is slow-path work.
            return self.slow().await;
        };
        let key = self.child_key(shard);
        let state = BucketState::decode(&key, &old)?;
        self.note_shards(self.entity_id, &state);

        if self
            .consume_milli
            .iter()
            .any(|(name, _)| state.limit(name).is_none())
        {
            return self.slow().await;
        }

        // Write pressure, not token exhaustion: double the shards and let
        // the slow path admit against the wider layout.
        if self.wcu_exhausted(&state) {
            self.reshard_for_pressure(state.shard_count).await?;
            return self.slow().await;
        }

        // Token exhaustion with spare shards: another shard may have the
        // balance this one lacks.
        if state.shard_count > 1 {
            for _ in 0..SPECULATIVE_SHARD_RETRIES {
                let retry_key = self.child_key(bucket::pick_shard(state.shard_count));
                match self
                    .core
                    .repo
                    .guarded_update(self.speculative_update(&retry_key))
                    .await?
                {
                    WriteOutcome::Applied { .. } => {
                        let deltas = consumption_deltas(&self.with_wcu_consumption());
                        return Ok(self.lease(vec![LeaseWrite { key: retry_key, deltas }]));
                    }
                    WriteOutcome::Rejected { .. } => continue,
                }
            }
            return self.slow().await;
        }

        self.child_failure_terminal(Some(old), &key)?;
        self.slow().await
    }

    /// Decides between fast rejection and slow-path fallback for a
    /// rejected child. Returns an error for the fast rejection; `Ok` means
    /// the caller should fall back.
    fn child_failure_terminal(&self, old: Option<Item>, key: &ItemKey) -> Result<()> {
        let Some(old) = old else {
            return Ok(());
        };
        let state = BucketState::decode(key, &old)?;
        if state.shard_count > 1 || self.wcu_exhausted(&state) {
            return Ok(());
        }
        let offenders = self.hopeless_offenders(&state, &self.config.limits, self.now());
        if offenders.is_empty() {
            // A refill would cover the shortfall: re-decide via the slow
            // path instead of rejecting a request that could pass.
            Ok(())
        } else {
            Err(Error::exceeded(offenders))
        }
    }

    /// Offending limits whose shortfall a refill alone cannot cover,
    /// with refill-adjusted deficits. An empty result means every
    /// shortfall is refillable.
    fn hopeless_offenders(
        &self,
        state: &BucketState,
        limits: &LimitSet,
        now_ms: i64,
    ) -> Vec<ExceededLimit> {
        let mut offenders = Vec::new();
        for (name, need) in &self.consume_milli {
            let Some(counters) = state.limit(name) else {
                continue;
            };
            let Some(limit) = limits.get(name) else {
                continue;
            };
            let (_, ra) = bucket::shard_limit(limit, state.shard_count);
            if counters.tokens >= *need {
                continue;
            }
            if kernel::would_refill_satisfy(
                counters.tokens,
                state.last_refill_ms,
                now_ms,
                ra,
                limit.refill_period_ms,
                need / MILLI,
            ) {
                continue;
            }
            let (tokens, _) = kernel::refill(
                counters.tokens,
                state.last_refill_ms,
                now_ms,
                counters.capacity,
                ra,
                limit.refill_period_ms,
            );
            offenders.push(ExceededLimit {
                name: name.clone(),
                deficit_milli: need - tokens,
                retry_after_ms: kernel::retry_after_ms(need - tokens, ra, limit.refill_period_ms),
            });
        }
        offenders
    }

    fn wcu_exhausted(&self, state: &BucketState) -> bool {
        state
            .limit(&LimitName::Wcu)
            .map_or(false, |c| c.tokens < WCU_COST_MILLI)
    }

    /// The speculative conditional write: pure consumption ADDs guarded
    /// by "bucket exists, every app limit covers its debit, and a write
    /// unit is available".
    fn speculative_update(&self, key: &ItemKey) -> Update {
        let mut update = Update::new(key.clone()).returning(ReturnValues::AllNew);
        let mut guards = vec![Condition::Exists];
        for (name, need) in &self.consume_milli {
            let tk = keys::bucket_attr(name.as_str(), BucketCol::Tokens);
            guards.push(Condition::Ge(tk.clone(), *need));
            update = update
                .add(tk, -need)
                .add(keys::bucket_attr(name.as_str(), BucketCol::Consumed), *need);
        }
        let wcu_tk = keys::bucket_attr(LimitName::Wcu.as_str(), BucketCol::Tokens);
        guards.push(Condition::Ge(wcu_tk.clone(), WCU_COST_MILLI));
        update = update.add(wcu_tk, -WCU_COST_MILLI).add(
            keys::bucket_attr(LimitName::Wcu.as_str(), BucketCol::Consumed),
            WCU_COST_MILLI,
        );
        update.condition(Condition::All(guards))
    }

    /// Doubles the shard count on shard 0 in response to write pressure.
    /// Losing the conditional to a concurrent resharder is fine — the
    /// count moved either way.
    async fn reshard_for_pressure(&self, observed: u32) -> Result<()> {
        let new_count = observed.saturating_mul(2);
        let shard0 = self.child_key(0);
        let sets = capacity_sets(&self.config.limits, new_count);
        if self.core.repo.reshard(&shard0, observed, new_count, sets).await? {
            tracing::info!(
                entity = self.entity_id,
                resource = self.resource,
                new_count,
                "doubled shard count under write pressure"
            );
        }
        self.core
            .entities
            .note_shard_count(self.ns(), self.entity_id, self.resource, new_count);
        Ok(())
    }

    /// Write pressure without token exhaustion is not a user-visible
    /// limit; it surfaces as a retryable rejection with no named limits.
    fn wcu_backpressure(&self, retry_after_ms: i64) -> Result<Option<Lease<S>>> {
        Err(Error::RateLimitExceeded { limits: Vec::new(), retry_after_ms })
    }

    // --- shared plumbing ------------------------------------------------

    async fn entity_meta(&self) -> Result<EntityMeta> {
        if let Some(meta) = self.core.entities.meta(self.ns(), self.entity_id) {
            return Ok(meta);
        }
        let entity = self
            .core
            .repo
            .get_entity(self.ns(), self.entity_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(self.entity_id.to_owned()))?;
        let meta = EntityMeta { cascade: entity.cascade, parent_id: entity.parent_id };
        self.core.entities.store_meta(self.ns(), self.entity_id, meta.clone());
        Ok(meta)
    }

    /// The parent's own limit resolution; a parent with no configuration
    /// of its own is limited by the child's resolution.
    async fn parent_limits(&self, parent_id: &str) -> Result<LimitSet> {
        match self.core.resolve_config(parent_id, self.resource).await? {
            Some(resolved) => Ok(resolved.limits.clone()),
            None => Ok(self.config.limits.clone()),
        }
    }

    fn cached_shard_count(&self, entity_id: &str) -> u32 {
        self.core.entities.shard_count(self.ns(), entity_id, self.resource)
    }

    fn note_shards(&self, entity_id: &str, state: &BucketState) {
        self.core
            .entities
            .note_shard_count(self.ns(), entity_id, self.resource, state.shard_count);
    }

    fn with_wcu_consumption(&self) -> Vec<(LimitName, i64)> {
        let mut consumed = self.consume_milli.clone();
        consumed.push((LimitName::Wcu, WCU_COST_MILLI));
        consumed
    }

    fn lease(&self, writes: Vec<LeaseWrite>) -> Lease<S> {
        Lease::new(
            self.core.clone(),
            self.entity_id.to_owned(),
            self.resource.to_owned(),
            writes,
        )
    }
}

/// The in-memory decision for one existing bucket shard: refill every
/// involved limit, check the debits, and emit the guarded update parts.
struct ConsumePlan {
    rejections: Vec<ExceededLimit>,
    wcu_retry_after_ms: Option<i64>,
    adds: Vec<(String, i64)>,
    sets: Vec<(String, AttrValue)>,
    conditions: Vec<Condition>,
    consumption: Vec<(String, i64)>,
    new_rf: Option<i64>,
    expected_rf: i64,
}

impl ConsumePlan {
    /// Builds the guarded wire update. The guard pins the refill clock
    /// (so a concurrent refill invalidates this plan instead of double
    /// refilling) and re-checks every balance net of the refill being
    /// folded in.
    fn into_update(self, key: &ItemKey) -> Update {
        let mut update = Update::new(key.clone());
        update.adds = self.adds;
        update.sets = self.sets;
        if let Some(rf) = self.new_rf {
            update = update.set(ATTR_REFILL, AttrValue::N(rf));
        }
        // A shard materialized by reshard propagation has no refill clock
        // yet; decoding reports that as zero, so zero must also match the
        // missing attribute.
        let rf_guard = if self.expected_rf == 0 {
            Condition::Any(vec![
                Condition::Missing(ATTR_REFILL.into()),
                Condition::Eq(ATTR_REFILL.into(), AttrValue::N(0)),
            ])
        } else {
            Condition::Eq(ATTR_REFILL.into(), AttrValue::N(self.expected_rf))
        };
        let mut guards = vec![rf_guard];
        guards.extend(self.conditions);
        update.condition(Condition::All(guards))
    }
}

/// Decides a consume against a decoded bucket state. `limits` are the
/// app limits; the write-capacity limit is appended internally.
fn plan_consume(
    state: &BucketState,
    limits: &LimitSet,
    consume_milli: &[(LimitName, i64)],
    now_ms: i64,
) -> ConsumePlan {
    let mut plan = ConsumePlan {
        rejections: Vec::new(),
        wcu_retry_after_ms: None,
        adds: Vec::new(),
        sets: Vec::new(),
        conditions: Vec::new(),
        consumption: Vec::new(),
        new_rf: None,
        expected_rf: state.last_refill_ms,
    };

    let wcu = Limit::wcu();
    let mut involved: Vec<(&LimitName, &Limit, i64)> = Vec::with_capacity(consume_milli.len() + 1);
    for (name, need) in consume_milli {
        if let Some(limit) = limits.get(name) {
            involved.push((name, limit, *need));
        }
    }
    involved.push((&wcu.name, &wcu, WCU_COST_MILLI));

    for (name, limit, need) in involved {
        let (cp_s, ra_s) = bucket::shard_limit(limit, state.shard_count);
        let tk_attr = keys::bucket_attr(name.as_str(), BucketCol::Tokens);
        let tc_attr = keys::bucket_attr(name.as_str(), BucketCol::Consumed);

        let Some(counters) = state.limit(name) else {
            // The limit was configured after this shard was created: seed
            // its columns as part of this write. ADD from absent starts
            // at zero, so the full fresh balance travels in the delta.
            if cp_s < need {
                plan.rejections.push(ExceededLimit {
                    name: name.clone(),
                    deficit_milli: need - cp_s,
                    retry_after_ms: kernel::retry_after_ms(need - cp_s, ra_s, limit.refill_period_ms),
                });
                continue;
            }
            plan.adds.push((tk_attr.clone(), cp_s - need));
            plan.adds.push((tc_attr.clone(), need));
            plan.sets
                .push((keys::bucket_attr(name.as_str(), BucketCol::Capacity), AttrValue::N(cp_s)));
            plan.consumption.push((tk_attr, -need));
            plan.consumption.push((tc_attr, need));
            continue;
        };

        let (tokens, advanced) = kernel::refill(
            counters.tokens,
            state.last_refill_ms,
            now_ms,
            counters.capacity,
            ra_s,
            limit.refill_period_ms,
        );
        let to_add = tokens - counters.tokens;

        if tokens < need {
            let deficit = need - tokens;
            let retry_after_ms = kernel::retry_after_ms(deficit, ra_s, limit.refill_period_ms);
            if name.is_reserved() {
                plan.wcu_retry_after_ms = Some(retry_after_ms);
            } else {
                plan.rejections.push(ExceededLimit {
                    name: name.clone(),
                    deficit_milli: deficit,
                    retry_after_ms,
                });
            }
            continue;
        }

        if to_add > 0 {
            // The shared refill clock advances by the smallest
            // drift-compensated step across the bucket's limits, so no
            // limit ever loses accumulated fractional progress.
            plan.new_rf = Some(plan.new_rf.map_or(advanced, |rf: i64| rf.min(advanced)));
        }
        plan.adds.push((tk_attr.clone(), to_add - need));
        plan.adds.push((tc_attr.clone(), need));
        plan.conditions.push(Condition::Ge(tk_attr.clone(), need - to_add));
        plan.consumption.push((tk_attr, -need));
        plan.consumption.push((tc_attr, need));
    }

    plan
}

/// Clones an app limit set with the reserved write-capacity limit
/// appended, the full set a bucket record carries.
pub(crate) fn with_wcu(limits: &LimitSet) -> LimitSet {
    let mut set = limits.clone();
    set.insert(LimitName::Wcu, Limit::wcu());
    set
}

/// Consumption deltas (balance down, consumed up) for a consume map.
fn consumption_deltas(consumed: &[(LimitName, i64)]) -> Vec<(String, i64)> {
    let mut deltas = Vec::with_capacity(consumed.len() * 2);
    for (name, need) in consumed {
        deltas.push((keys::bucket_attr(name.as_str(), BucketCol::Tokens), -need));
        deltas.push((keys::bucket_attr(name.as_str(), BucketCol::Consumed), *need));
    }
    deltas
}

/// Shard-effective capacity SETs for a new shard count, applied alongside
/// reshard writes so `cp` tracks the layout.
pub(crate) fn capacity_sets(limits: &LimitSet, shard_count: u32) -> Vec<(String, AttrValue)> {
    limits
        .iter()
        .map(|(name, limit)| {
            let (cp, _) = bucket::shard_limit(limit, shard_count);
            (keys::bucket_attr(name.as_str(), BucketCol::Capacity), AttrValue::N(cp))
        })
        .collect()
}
