//! Typed data access over a [`Store`].
//!
//! Every store interaction in the crate funnels through this layer: it
//! owns retry-with-backoff for transient failures, degrades around
//! missing adapter capabilities, and converts raw adapter errors into the
//! crate taxonomy. Condition failures are *not* errors at this layer —
//! they are decisions — so the methods that issue guarded writes surface
//! them as typed outcomes instead.

use std::time::Duration;

use crate::config::ConfigScope;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::keys::{self, ATTR_CONFIG_VERSION, ATTR_TTL, ItemKey};
use crate::store::{
    AttrValue, Condition, Item, ReturnValues, Store, StoreError, Update,
};

/// Retry behavior for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(25) }
    }
}

/// The limiter's data-access layer.
pub(crate) struct Repository<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: Store> Repository<S> {
    pub(crate) fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    /// Runs an operation, retrying transient failures with exponential
    /// backoff. Condition failures and hard errors pass through at once.
    async fn with_retry<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
    ) -> std::result::Result<T, StoreError>
    where
        Fut: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(StoreError::Unavailable { message, transient: true })
                    if attempt < self.retry.attempts =>
                {
                    tracing::warn!(attempt, %message, "transient store failure, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // --- entities -------------------------------------------------------

    pub(crate) async fn get_entity(&self, ns: &str, entity_id: &str) -> Result<Option<Entity>> {
        let key = keys::entity_meta(ns, entity_id);
        let item = self
            .with_retry(|| self.store.get_item(&key))
            .await
            .map_err(into_error)?;
        item.map(|i| Entity::decode(entity_id, &i)).transpose()
    }

    /// Writes an entity record. With `if_absent`, an existing record
    /// rejects the write.
    pub(crate) async fn put_entity(&self, ns: &str, entity: &Entity, if_absent: bool) -> Result<()> {
        let key = keys::entity_meta(ns, &entity.id);
        let item = entity.encode();
        let condition = if_absent.then_some(Condition::NotExists);
        match self
            .with_retry(|| self.store.put_item(&key, item.clone(), condition.clone()))
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed { .. }) => Err(Error::Configuration(format!(
                "entity '{}' already exists",
                entity.id
            ))),
            Err(e) => Err(into_error(e)),
        }
    }

    /// Deletes every record the entity owns: metadata, entity-scoped
    /// configs, usage snapshots, all bucket shards, and the audit trail.
    pub(crate) async fn delete_entity_records(&self, ns: &str, entity_id: &str) -> Result<()> {
        let entity_pk = keys::entity_meta(ns, entity_id).pk;
        let mut doomed: Vec<ItemKey> = self
            .with_retry(|| self.store.query_prefix(&entity_pk, ""))
            .await
            .map_err(into_error)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        let bucket_pk_prefix = keys::bucket_pk_prefix(ns, entity_id);
        doomed.extend(
            self.with_retry(|| self.store.scan_pk_prefix(&bucket_pk_prefix))
                .await
                .map_err(into_error)?,
        );
        let audit_pk = keys::audit_pk(ns, entity_id);
        doomed.extend(
            self.with_retry(|| self.store.scan_pk_prefix(&audit_pk))
                .await
                .map_err(into_error)?,
        );

        for key in doomed {
            self.with_retry(|| self.store.delete_item(&key))
                .await
                .map_err(into_error)?;
        }
        Ok(())
    }

    // --- configuration --------------------------------------------------

    /// Fetches the four candidate config records in precedence order:
    /// entity-resource, entity-default, resource, system. One batch read
    /// when the adapter supports it, four sequential reads otherwise.
    pub(crate) async fn fetch_config_candidates(
        &self,
        ns: &str,
        entity_id: &str,
        resource: &str,
    ) -> Result<[Option<Item>; 4]> {
        let candidates = [
            keys::entity_config(ns, entity_id, resource),
            keys::entity_default_config(ns, entity_id),
            keys::resource_config(ns, resource),
            keys::system_config(ns),
        ];

        if self.store.capabilities().batch_operations {
            let mut items = self
                .with_retry(|| self.store.batch_get(&candidates))
                .await
                .map_err(into_error)?
                .into_iter();
            Ok(std::array::from_fn(|_| items.next().flatten()))
        } else {
            let mut out = [None, None, None, None];
            for (slot, key) in out.iter_mut().zip(&candidates) {
                *slot = self
                    .with_retry(|| self.store.get_item(key))
                    .await
                    .map_err(into_error)?;
            }
            Ok(out)
        }
    }

    /// Writes a config record, bumping its version counter, and returns
    /// the new version.
    pub(crate) async fn write_config(
        &self,
        ns: &str,
        scope: &ConfigScope,
        sets: Vec<(String, AttrValue)>,
    ) -> Result<i64> {
        let mut update = Update::new(scope.key(ns))
            .add(ATTR_CONFIG_VERSION, 1)
            .returning(ReturnValues::AllNew);
        update.sets = sets;

        let image = self
            .with_retry(|| self.store.update_item(update.clone()))
            .await
            .map_err(into_error)?;
        Ok(image
            .as_ref()
            .and_then(|i| crate::store::get_n(i, ATTR_CONFIG_VERSION))
            .unwrap_or_default())
    }

    pub(crate) async fn delete_config(&self, ns: &str, scope: &ConfigScope) -> Result<()> {
        let key = scope.key(ns);
        self.with_retry(|| self.store.delete_item(&key))
            .await
            .map_err(into_error)
    }

    // --- buckets --------------------------------------------------------

    pub(crate) async fn read_bucket(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.with_retry(|| self.store.get_item(key))
            .await
            .map_err(into_error)
    }

    pub(crate) async fn read_buckets(&self, bucket_keys: &[ItemKey]) -> Result<Vec<Option<Item>>> {
        if self.store.capabilities().batch_operations {
            self.with_retry(|| self.store.batch_get(bucket_keys))
                .await
                .map_err(into_error)
        } else {
            let mut out = Vec::with_capacity(bucket_keys.len());
            for key in bucket_keys {
                out.push(
                    self.with_retry(|| self.store.get_item(key))
                        .await
                        .map_err(into_error)?,
                );
            }
            Ok(out)
        }
    }

    /// Creates a bucket shard from its initial image. `false` means
    /// another writer created it first.
    pub(crate) async fn create_bucket(&self, key: &ItemKey, item: Item) -> Result<bool> {
        match self
            .with_retry(|| self.store.put_item(key, item.clone(), Some(Condition::NotExists)))
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::ConditionFailed { .. }) => Ok(false),
            Err(e) => Err(into_error(e)),
        }
    }

    /// Issues one guarded update, surfacing a condition failure as a
    /// typed outcome carrying whichever image the update requested.
    pub(crate) async fn guarded_update(&self, update: Update) -> Result<WriteOutcome> {
        match self.with_retry(|| self.store.update_item(update.clone())).await {
            Ok(image) => Ok(WriteOutcome::Applied { image }),
            Err(StoreError::ConditionFailed { item }) => Ok(WriteOutcome::Rejected { old: item }),
            Err(e) => Err(into_error(e)),
        }
    }

    /// Applies a child+parent write pair atomically. Without transaction
    /// support the pair degrades to two independent writes: the child
    /// first, then the parent, compensating the child's consumption if
    /// the parent's guard fails — the same shape as the speculative
    /// cascade, minus the cross-item atomicity the adapter cannot give.
    ///
    /// `child_consumption` is the consumption share of the child's ADDs;
    /// any refill share folded into the same wire write legitimately
    /// happened and must survive the compensation.
    pub(crate) async fn transact_pair(
        &self,
        child: Update,
        parent: Update,
        child_consumption: &[(String, i64)],
    ) -> Result<PairOutcome> {
        if self.store.capabilities().transactions {
            match self
                .with_retry(|| self.store.transact(vec![child.clone(), parent.clone()]))
                .await
            {
                Ok(()) => Ok(PairOutcome::Applied),
                Err(StoreError::TransactionCanceled { mut reasons }) => {
                    let parent_old = reasons.pop().flatten();
                    let child_old = reasons.pop().flatten();
                    Ok(PairOutcome::Canceled { child_old, parent_old })
                }
                Err(e) => Err(into_error(e)),
            }
        } else {
            let child_key = child.key.clone();
            match self.guarded_update(child).await? {
                WriteOutcome::Rejected { old } => {
                    return Ok(PairOutcome::Canceled { child_old: old, parent_old: None });
                }
                WriteOutcome::Applied { .. } => {}
            }
            match self.guarded_update(parent).await? {
                WriteOutcome::Applied { .. } => Ok(PairOutcome::Applied),
                WriteOutcome::Rejected { old } => {
                    self.compensate(&child_key, child_consumption).await;
                    Ok(PairOutcome::Canceled { child_old: None, parent_old: old })
                }
            }
        }
    }

    /// Undoes previously applied ADDs with their exact negation. ADD
    /// commutes, so this is unconditional and safe to repeat; a failure
    /// is logged and swallowed — compensation must never mask the error
    /// that triggered it.
    pub(crate) async fn compensate(&self, key: &ItemKey, adds: &[(String, i64)]) {
        let mut update = Update::new(key.clone());
        for (attr, delta) in adds {
            update = update.add(attr.clone(), -delta);
        }
        if let Err(e) = self.with_retry(|| self.store.update_item(update.clone())).await {
            tracing::warn!(key = %key, error = %e, "compensating write failed");
        }
    }

    /// Like [`compensate`](Self::compensate), but surfaces the failure.
    /// Used by explicit rollback, where the caller wants to know.
    pub(crate) async fn apply_adds(&self, key: &ItemKey, adds: &[(String, i64)]) -> Result<()> {
        let mut update = Update::new(key.clone());
        for (attr, delta) in adds {
            update = update.add(attr.clone(), *delta);
        }
        self.with_retry(|| self.store.update_item(update.clone()))
            .await
            .map(|_| ())
            .map_err(into_error)
    }

    /// Proactive refill: ADD the deltas and stamp the refill clock,
    /// guarded on the clock not having moved. `false` means a concurrent
    /// refill won the race; the loser is silently skipped.
    pub(crate) async fn refill_bucket(
        &self,
        key: &ItemKey,
        adds: Vec<(String, i64)>,
        expected_rf: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let mut update = Update::new(key.clone())
            .set(keys::ATTR_REFILL, AttrValue::N(now_ms))
            .condition(Condition::Eq(keys::ATTR_REFILL.into(), AttrValue::N(expected_rf)));
        update.adds = adds;

        match self.guarded_update(update).await? {
            WriteOutcome::Applied { .. } => Ok(true),
            WriteOutcome::Rejected { .. } => Ok(false),
        }
    }

    /// Doubles the shard count on shard 0, rewriting the shard-effective
    /// capacities to match. `false` means a concurrent resharder won.
    pub(crate) async fn reshard(
        &self,
        shard0: &ItemKey,
        old_count: u32,
        new_count: u32,
        capacity_sets: Vec<(String, AttrValue)>,
    ) -> Result<bool> {
        let mut update = Update::new(shard0.clone())
            .set(keys::ATTR_SHARD_COUNT, AttrValue::N(i64::from(new_count)))
            .condition(Condition::Eq(
                keys::ATTR_SHARD_COUNT.into(),
                AttrValue::N(i64::from(old_count)),
            ));
        update.sets.extend(capacity_sets);

        match self.guarded_update(update).await? {
            WriteOutcome::Applied { .. } => Ok(true),
            WriteOutcome::Rejected { .. } => Ok(false),
        }
    }

    /// Propagates a raised shard count to one follower shard. Applies
    /// only if the follower is lower or has never seen a count; followers
    /// may lag shard 0 but never exceed it.
    pub(crate) async fn propagate_shard_count(
        &self,
        shard: &ItemKey,
        new_count: u32,
        capacity_sets: Vec<(String, AttrValue)>,
    ) -> Result<bool> {
        let mut update = Update::new(shard.clone())
            .set(keys::ATTR_SHARD_COUNT, AttrValue::N(i64::from(new_count)))
            .condition(Condition::Any(vec![
                Condition::Missing(keys::ATTR_SHARD_COUNT.into()),
                Condition::Lt(keys::ATTR_SHARD_COUNT.into(), i64::from(new_count)),
            ]));
        update.sets.extend(capacity_sets);

        match self.guarded_update(update).await? {
            WriteOutcome::Applied { .. } => Ok(true),
            WriteOutcome::Rejected { .. } => Ok(false),
        }
    }

    // --- usage & audit --------------------------------------------------

    /// Folds consumption into a usage snapshot window via commutative
    /// ADDs, stamping the window's expiry.
    pub(crate) async fn add_usage(
        &self,
        key: &ItemKey,
        adds: Vec<(String, i64)>,
        ttl_ms: i64,
    ) -> Result<()> {
        let mut update = Update::new(key.clone()).set(ATTR_TTL, AttrValue::N(ttl_ms));
        update.adds = adds;
        self.with_retry(|| self.store.update_item(update.clone()))
            .await
            .map(|_| ())
            .map_err(into_error)
    }

    pub(crate) async fn query_items(&self, pk: &str, sk_prefix: &str) -> Result<Vec<(ItemKey, Item)>> {
        self.with_retry(|| self.store.query_prefix(pk, sk_prefix))
            .await
            .map_err(into_error)
    }

    pub(crate) async fn append_audit(&self, key: &ItemKey, item: Item) -> Result<()> {
        self.with_retry(|| self.store.put_item(key, item.clone(), None))
            .await
            .map_err(into_error)
    }

    // --- namespaces -----------------------------------------------------

    /// Writes the forward and reverse registry records for a namespace.
    /// With transactions the pair is atomic; without, the forward record
    /// (the uniqueness anchor) goes first. `false` means the name is
    /// already registered.
    pub(crate) async fn register_namespace(
        &self,
        forward: (ItemKey, Item),
        reverse: (ItemKey, Item),
    ) -> Result<bool> {
        if self.store.capabilities().transactions {
            let mut fwd = Update::new(forward.0).condition(Condition::NotExists);
            fwd.sets = forward.1.into_iter().collect();
            let mut rev = Update::new(reverse.0).condition(Condition::NotExists);
            rev.sets = reverse.1.into_iter().collect();

            match self.with_retry(|| self.store.transact(vec![fwd.clone(), rev.clone()])).await {
                Ok(()) => Ok(true),
                Err(StoreError::TransactionCanceled { .. }) => Ok(false),
                Err(e) => Err(into_error(e)),
            }
        } else {
            match self
                .with_retry(|| {
                    self.store
                        .put_item(&forward.0, forward.1.clone(), Some(Condition::NotExists))
                })
                .await
            {
                Ok(()) => {}
                Err(StoreError::ConditionFailed { .. }) => return Ok(false),
                Err(e) => return Err(into_error(e)),
            }
            self.with_retry(|| self.store.put_item(&reverse.0, reverse.1.clone(), None))
                .await
                .map_err(into_error)?;
            Ok(true)
        }
    }

    pub(crate) async fn get_raw(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.with_retry(|| self.store.get_item(key))
            .await
            .map_err(into_error)
    }

    pub(crate) async fn set_attrs(&self, key: &ItemKey, sets: Vec<(String, AttrValue)>) -> Result<()> {
        let mut update = Update::new(key.clone());
        update.sets = sets;
        self.with_retry(|| self.store.update_item(update.clone()))
            .await
            .map(|_| ())
            .map_err(into_error)
    }

    /// Deletes every item under a partition-key prefix. Backs namespace
    /// purge.
    pub(crate) async fn purge_pk_prefix(&self, pk_prefix: &str) -> Result<usize> {
        let doomed = self
            .with_retry(|| self.store.scan_pk_prefix(pk_prefix))
            .await
            .map_err(into_error)?;
        let count = doomed.len();
        for key in doomed {
            self.with_retry(|| self.store.delete_item(&key))
                .await
                .map_err(into_error)?;
        }
        Ok(count)
    }

    pub(crate) async fn delete_raw(&self, key: &ItemKey) -> Result<()> {
        self.with_retry(|| self.store.delete_item(key))
            .await
            .map_err(into_error)
    }

    pub(crate) async fn poll_changes(
        &self,
        cursor: u64,
        max: usize,
    ) -> Result<Vec<crate::store::ChangeRecord>> {
        self.with_retry(|| self.store.poll_changes(cursor, max))
            .await
            .map_err(into_error)
    }
}

/// Outcome of a guarded single-item write.
pub(crate) enum WriteOutcome {
    /// The guard held and the write applied; carries the requested image.
    Applied { image: Option<Item> },

    /// The guard failed; carries the pre-write image when requested.
    Rejected { old: Option<Item> },
}

/// Outcome of a child+parent write pair.
pub(crate) enum PairOutcome {
    /// Both writes applied.
    Applied,

    /// At least one guard failed and nothing is applied (or the degraded
    /// two-write path compensated the child). Old images identify the
    /// failing member(s).
    Canceled {
        child_old: Option<Item>,
        parent_old: Option<Item>,
    },
}

/// Maps adapter errors that escaped typed handling into the crate
/// taxonomy.
pub(crate) fn into_error(e: StoreError) -> Error {
    match e {
        StoreError::Unavailable { message, transient } => {
            Error::StoreUnavailable { message, transient }
        }
        StoreError::Unsupported(op) => {
            Error::Internal(format!("store adapter does not support {op}"))
        }
        StoreError::ConditionFailed { .. } | StoreError::TransactionCanceled { .. } => {
            Error::Internal(format!("unexpected store response: {e}"))
        }
    }
}
