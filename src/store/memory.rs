//! In-memory reference store.
//!
//! Implements the full [`Store`](super::Store) contract — conditional
//! writes, atomic transactions, lazy TTL expiry, and a buffered change
//! feed — behind a single mutex, which makes every operation trivially
//! linearizable. This is the adapter the test suites run against and a
//! usable backend for single-process deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use crate::kernel::{SystemTimeSource, TimeSource};
use crate::keys::{ATTR_TTL, ItemKey};

use super::{
    AttrValue, Capabilities, ChangeRecord, Condition, Item, ReturnValues, Store, StoreError,
    Update, get_n,
};

#[derive(Default)]
struct Inner {
    /// pk → sk → item. BTreeMaps give prefix queries for free.
    partitions: BTreeMap<String, BTreeMap<String, Item>>,

    /// Buffered change feed, oldest first.
    changes: Vec<ChangeRecord>,

    /// Last assigned feed sequence.
    sequence: u64,

    /// Remaining operations to fail, with the transience to report.
    faults: Option<(u32, bool)>,
}

/// The in-memory store.
///
/// Cloning is cheap and clones share state, mirroring how a client handle
/// for a remote store behaves.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    time: Arc<dyn TimeSource>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Creates an empty store on a caller-provided clock. TTL expiry
    /// follows that clock, which lets tests expire items deterministically.
    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), time }
    }

    /// Makes the next `count` operations fail with
    /// [`StoreError::Unavailable`]. `transient` selects which failure kind
    /// the adapter reports. Test hook for outage and retry behavior.
    pub fn fail_next(&self, count: u32, transient: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.faults = Some((count, transient));
    }

    /// Number of buffered change records. Test hook.
    pub fn change_count(&self) -> usize {
        self.inner.lock().unwrap().changes.len()
    }

    fn check_fault(inner: &mut Inner) -> Result<(), StoreError> {
        if let Some((remaining, transient)) = inner.faults {
            if remaining > 0 {
                inner.faults = Some((remaining - 1, transient));
                return Err(StoreError::Unavailable {
                    message: "injected fault".into(),
                    transient,
                });
            }
            inner.faults = None;
        }
        Ok(())
    }

    /// Reads an item, dropping it if its TTL has passed.
    fn live_item<'a>(inner: &'a mut Inner, key: &ItemKey, now_ms: i64) -> Option<&'a Item> {
        let partition = inner.partitions.get_mut(&key.pk)?;
        let expired = partition
            .get(&key.sk)
            .and_then(|item| get_n(item, ATTR_TTL))
            .is_some_and(|ttl| ttl <= now_ms);
        if expired {
            partition.remove(&key.sk);
            return None;
        }
        inner.partitions.get(&key.pk)?.get(&key.sk)
    }

    fn record_change(inner: &mut Inner, key: &ItemKey, old: Option<Item>, new: Option<Item>) {
        inner.sequence += 1;
        inner.changes.push(ChangeRecord { sequence: inner.sequence, key: key.clone(), old, new });
    }

    /// Applies one update against the current state. The caller has
    /// already evaluated the condition.
    fn apply(inner: &mut Inner, update: &Update) {
        let old = inner
            .partitions
            .get(&update.key.pk)
            .and_then(|p| p.get(&update.key.sk))
            .cloned();

        let partition = inner.partitions.entry(update.key.pk.clone()).or_default();
        let item = partition.entry(update.key.sk.clone()).or_default();

        for (attr, delta) in &update.adds {
            let current = get_n(item, attr).unwrap_or_default();
            item.insert(attr.clone(), AttrValue::N(current + delta));
        }
        for (attr, value) in &update.sets {
            item.insert(attr.clone(), value.clone());
        }

        let new = Some(item.clone());
        Self::record_change(inner, &update.key, old, new);
    }
}

impl Store for MemoryStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities { batch_operations: true, transactions: true, change_feed: true }
    }

    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        Ok(Self::live_item(&mut inner, key, now).cloned())
    }

    async fn batch_get(&self, keys: &[ItemKey]) -> Result<Vec<Option<Item>>, StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        Ok(keys
            .iter()
            .map(|key| Self::live_item(&mut inner, key, now).cloned())
            .collect())
    }

    async fn put_item(
        &self,
        key: &ItemKey,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        let current = Self::live_item(&mut inner, key, now).cloned();
        if let Some(condition) = condition {
            if !condition.eval(current.as_ref()) {
                return Err(StoreError::ConditionFailed { item: None });
            }
        }

        inner
            .partitions
            .entry(key.pk.clone())
            .or_default()
            .insert(key.sk.clone(), item.clone());
        Self::record_change(&mut inner, key, current, Some(item));
        Ok(())
    }

    async fn update_item(&self, update: Update) -> Result<Option<Item>, StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        let current = Self::live_item(&mut inner, &update.key, now).cloned();
        if let Some(condition) = &update.condition {
            if !condition.eval(current.as_ref()) {
                let item = match update.return_values {
                    ReturnValues::None => None,
                    _ => current,
                };
                return Err(StoreError::ConditionFailed { item });
            }
        }

        Self::apply(&mut inner, &update);
        let image = match update.return_values {
            ReturnValues::None => None,
            ReturnValues::AllOld => current,
            ReturnValues::AllNew => inner
                .partitions
                .get(&update.key.pk)
                .and_then(|p| p.get(&update.key.sk))
                .cloned(),
        };
        Ok(image)
    }

    async fn transact(&self, updates: Vec<Update>) -> Result<(), StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        // First pass: every condition against the pre-transaction state.
        let mut failed = false;
        let mut reasons = Vec::with_capacity(updates.len());
        for update in &updates {
            let current = Self::live_item(&mut inner, &update.key, now).cloned();
            let holds = update
                .condition
                .as_ref()
                .map_or(true, |c| c.eval(current.as_ref()));
            if holds {
                reasons.push(None);
            } else {
                failed = true;
                reasons.push(current);
            }
        }
        if failed {
            return Err(StoreError::TransactionCanceled { reasons });
        }

        // Second pass: apply all members.
        for update in &updates {
            Self::apply(&mut inner, update);
        }
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        let old = inner
            .partitions
            .get_mut(&key.pk)
            .and_then(|p| p.remove(&key.sk));
        if old.is_some() {
            Self::record_change(&mut inner, key, old, None);
        }
        Ok(())
    }

    async fn query_prefix(
        &self,
        pk: &str,
        sk_prefix: &str,
    ) -> Result<Vec<(ItemKey, Item)>, StoreError> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        let Some(partition) = inner.partitions.get(pk) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .range::<String, _>((Bound::Included(sk_prefix.to_owned()), Bound::Unbounded))
            .take_while(|(sk, _)| sk.starts_with(sk_prefix))
            .filter(|(_, item)| !get_n(item, ATTR_TTL).is_some_and(|ttl| ttl <= now))
            .map(|(sk, item)| (ItemKey::new(pk, sk.clone()), item.clone()))
            .collect())
    }

    async fn scan_pk_prefix(&self, pk_prefix: &str) -> Result<Vec<ItemKey>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        Ok(inner
            .partitions
            .range::<String, _>((Bound::Included(pk_prefix.to_owned()), Bound::Unbounded))
            .take_while(|(pk, _)| pk.starts_with(pk_prefix))
            .flat_map(|(pk, partition)| {
                partition.keys().map(move |sk| ItemKey::new(pk.clone(), sk.clone()))
            })
            .collect())
    }

    async fn poll_changes(&self, cursor: u64, max: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;

        let start = inner.changes.partition_point(|r| r.sequence <= cursor);
        Ok(inner.changes[start..].iter().take(max).cloned().collect())
    }
}
