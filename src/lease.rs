//! Leases: scoped holds on rate-limit budget.
//!
//! A lease is handed out only after its initial consumption is durably
//! written (*write-on-enter*), so concurrent callers observe the debit
//! immediately. From there the lease moves through a small state machine:
//!
//! - `Active` — the scope is running; adjustments accumulate in memory.
//! - `Committed` — released normally; adjustments were flushed.
//! - `RolledBack` — the scope failed; the initial deltas were negated.
//!
//! Adjustments and rollbacks are independent, unconditional ADD writes.
//! ADD commutes, so they are safe to issue concurrently and out of order
//! with other callers; partial success plus retry converges to the
//! correct final state. Rollback failures are logged and never allowed to
//! mask the error that caused the rollback.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::Result;
use crate::kernel::MILLI;
use crate::keys::{self, BucketCol, ItemKey};
use crate::limiter::Core;
use crate::limits::LimitName;
use crate::store::Store;

pub(crate) mod acquire;

/// Lifecycle of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Held; consumption is written and adjustments accumulate.
    Active,

    /// Released; accumulated adjustments were flushed.
    Committed,

    /// Rolled back; the initial deltas were exactly negated.
    RolledBack,
}

/// The ADD deltas one acquire applied to one item. Rollback writes the
/// exact negation of these — consumption only, never the refill share
/// that may have traveled in the same wire write.
#[derive(Debug, Clone)]
pub(crate) struct LeaseWrite {
    pub key: ItemKey,
    pub deltas: Vec<(String, i64)>,
}

/// A held rate-limit acquisition.
///
/// Dropping an active lease (including by cancellation) triggers a
/// best-effort background rollback; prefer calling [`release`] or
/// [`rollback`] explicitly, or use
/// [`Limiter::acquire_scoped`](crate::Limiter::acquire_scoped) which does
/// it for you.
///
/// [`release`]: Lease::release
/// [`rollback`]: Lease::rollback
pub struct Lease<S: Store> {
    core: Arc<Core<S>>,
    state: LeaseState,
    entity_id: String,
    resource: String,
    writes: Vec<LeaseWrite>,
    adjustments: Mutex<IndexMap<LimitName, i64>>,
}

impl<S: Store> std::fmt::Debug for Lease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("state", &self.state)
            .field("entity_id", &self.entity_id)
            .field("resource", &self.resource)
            .field("writes", &self.writes)
            .finish()
    }
}

impl<S: Store> Lease<S> {
    pub(crate) fn new(
        core: Arc<Core<S>>,
        entity_id: String,
        resource: String,
        writes: Vec<LeaseWrite>,
    ) -> Self {
        Self {
            core,
            state: LeaseState::Active,
            entity_id,
            resource,
            writes,
            adjustments: Mutex::new(IndexMap::new()),
        }
    }

    /// A lease admitted without metering under a fail-open policy. It
    /// holds no written state, so release and rollback are no-ops.
    pub(crate) fn unmetered(core: Arc<Core<S>>, entity_id: String, resource: String) -> Self {
        Self::new(core, entity_id, resource, Vec::new())
    }

    /// The entity this lease draws from.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The resource this lease draws from.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Whether this lease was admitted unmetered under fail-open.
    pub fn is_unmetered(&self) -> bool {
        self.writes.is_empty()
    }

    /// Records additional consumption (positive `tokens`) or gives some
    /// back (negative), in whole tokens. Nothing is written until the
    /// lease is released; the deltas then flush as one independent write
    /// per item.
    pub fn adjust(&self, limit: impl Into<LimitName>, tokens: i64) {
        if self.writes.is_empty() {
            return;
        }
        let mut pending = self.adjustments.lock().unwrap();
        *pending.entry(limit.into()).or_insert(0) += tokens * MILLI;
    }

    /// Commits the lease: flushes accumulated adjustments, one
    /// unconditional write per item, and transitions to `Committed`.
    ///
    /// The lease counts as committed even if a flush write fails — the
    /// initial consumption stands, and the returned error reports only
    /// the flush.
    pub async fn release(mut self) -> Result<()> {
        self.state = LeaseState::Committed;

        let pending: Vec<(LimitName, i64)> = {
            let mut lock = self.adjustments.lock().unwrap();
            std::mem::take(&mut *lock)
                .into_iter()
                .filter(|(_, delta)| *delta != 0)
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let mut adds = Vec::with_capacity(pending.len() * 2);
        for (name, delta_milli) in &pending {
            let name = name.as_str();
            adds.push((keys::bucket_attr(name, BucketCol::Tokens), -delta_milli));
            adds.push((keys::bucket_attr(name, BucketCol::Consumed), *delta_milli));
        }

        for write in &self.writes {
            self.core.repo.apply_adds(&write.key, &adds).await?;
        }
        Ok(())
    }

    /// Rolls the lease back: writes the exact negation of the deltas the
    /// acquire wrote, for every item it touched, and transitions to
    /// `RolledBack`. Accumulated adjustments were never written, so they
    /// are simply discarded.
    pub async fn rollback(mut self) -> Result<()> {
        self.state = LeaseState::RolledBack;
        let mut first_err = None;
        for write in &self.writes {
            let negated: Vec<(String, i64)> =
                write.deltas.iter().map(|(attr, d)| (attr.clone(), -d)).collect();
            if let Err(e) = self.core.repo.apply_adds(&write.key, &negated).await {
                tracing::warn!(key = %write.key, error = %e, "rollback write failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Rollback for error paths: failures are logged but swallowed so the
    /// original error stays visible.
    pub(crate) async fn rollback_logged(self) {
        let entity = self.entity_id.clone();
        if let Err(e) = self.rollback().await {
            tracing::warn!(entity = %entity, error = %e, "rollback after scope failure did not complete");
        }
    }
}

impl<S: Store> Drop for Lease<S> {
    fn drop(&mut self) {
        if self.state != LeaseState::Active || self.writes.is_empty() {
            return;
        }
        // Dropped while active: cancellation or a forgotten lease. Run the
        // compensation in the background; ADD negation is safe to apply
        // regardless of what else happened in the meantime.
        tracing::warn!(
            entity = %self.entity_id,
            resource = %self.resource,
            "lease dropped while active; compensating in background"
        );
        let core = self.core.clone();
        let writes = std::mem::take(&mut self.writes);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for write in writes {
                    // compensate() negates the deltas it is given.
                    core.repo.compensate(&write.key, &write.deltas).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_negates_deltas_exactly() {
        let write = LeaseWrite {
            key: keys::bucket("ns", "e", "r", 0),
            deltas: vec![("b_rpm_tk".into(), -1_000), ("b_rpm_tc".into(), 1_000)],
        };
        let negated: Vec<(String, i64)> =
            write.deltas.iter().map(|(attr, d)| (attr.clone(), -d)).collect();

        assert_eq!(negated[0], ("b_rpm_tk".into(), 1_000));
        assert_eq!(negated[1], ("b_rpm_tc".into(), -1_000));
    }
}
