//! The limiter: construction, acquires, availability, and governance.
//!
//! A [`Limiter`] owns everything one namespace's clients share in a
//! process: the store handle, the config cache, and the entity metadata
//! cache. Two limiters never share cache state, so independent namespaces
//! (or tests) cannot contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;

use crate::audit::{self, AuditAction};
use crate::bucket::{self, BucketState};
use crate::config::{
    self, ConfigCache, ConfigScope, DEFAULT_CONFIG_TTL, OnUnavailable, ResolvedConfig,
};
use crate::entity::{Entity, EntityCache, EntityMeta};
use crate::error::{Error, Result};
use crate::kernel::{self, MILLI, SystemTimeSource, TimeSource};
use crate::keys;
use crate::lease::acquire::AcquireRun;
use crate::lease::Lease;
use crate::limits::{ConsumeMap, Limit, LimitName};
use crate::repository::{Repository, RetryPolicy};
use crate::store::Store;

/// Shared internals of one limiter instance.
pub(crate) struct Core<S> {
    pub(crate) repo: Repository<S>,
    pub(crate) ns: String,
    pub(crate) configs: ConfigCache,
    pub(crate) entities: EntityCache,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) speculate: bool,
    unavailable_overrides: HashMap<String, OnUnavailable>,
}

impl<S: Store> Core<S> {
    /// Cached config resolution for one (entity, resource).
    pub(crate) async fn resolve_config(
        &self,
        entity_id: &str,
        resource: &str,
    ) -> Result<Option<Arc<ResolvedConfig>>> {
        if let Some(hit) = self.configs.get(&self.ns, entity_id, resource) {
            return Ok(Some(hit));
        }
        let candidates = self
            .repo
            .fetch_config_candidates(&self.ns, entity_id, resource)
            .await?;
        let refs = std::array::from_fn(|i| candidates[i].as_ref());
        match config::resolve(refs)? {
            Some(resolved) => {
                let resolved = Arc::new(resolved);
                self.configs.insert(&self.ns, entity_id, resource, resolved.clone());
                Ok(Some(resolved))
            }
            None => Ok(None),
        }
    }

    /// The unavailability policy for a resource: a builder override wins
    /// over the configured record's policy; the default is fail-closed.
    fn unavailable_policy(
        &self,
        resolved: Option<&ResolvedConfig>,
        resource: &str,
    ) -> OnUnavailable {
        self.unavailable_overrides
            .get(resource)
            .copied()
            .or(resolved.map(|r| r.on_unavailable))
            .unwrap_or_default()
    }
}

/// Parameters of one acquire.
///
/// Consumption is expressed in whole tokens per limit; post-completion
/// corrections go through [`Lease::adjust`]. Cascade is *not* a parameter
/// here — whether an acquire also draws from a parent is a property of
/// the entity, declared at entity creation.
#[derive(Debug, Clone)]
pub struct Acquire {
    entity_id: String,
    resource: String,
    consume: ConsumeMap,
    limits: Option<Vec<Limit>>,
}

impl Acquire {
    /// Starts an acquire for an entity on a resource.
    pub fn new(entity_id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            resource: resource.into(),
            consume: ConsumeMap::new(),
            limits: None,
        }
    }

    /// Adds initial consumption of `tokens` whole tokens against a limit.
    pub fn consume(mut self, limit: impl Into<LimitName>, tokens: i64) -> Self {
        *self.consume.entry(limit.into()).or_insert(0) += tokens;
        self
    }

    /// Limits to enforce when nothing is configured at any scope for this
    /// (entity, resource). Configured records always win over these.
    pub fn with_limits(mut self, limits: Vec<Limit>) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// A handle to the rate limiter for one namespace.
pub struct Limiter<S: Store> {
    core: Arc<Core<S>>,
}

impl<S: Store> Clone for Limiter<S> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone() }
    }
}

impl<S: Store> Limiter<S> {
    /// Starts building a limiter over a store adapter.
    pub fn builder(store: S) -> LimiterBuilder<S> {
        LimiterBuilder::new(store)
    }

    /// The namespace this limiter is bound to.
    pub fn namespace(&self) -> &str {
        &self.core.ns
    }

    // --- acquire --------------------------------------------------------

    /// Acquires rate-limit budget, returning a [`Lease`] once the initial
    /// consumption is durably written.
    ///
    /// Rejections ([`Error::RateLimitExceeded`]) are decided before any
    /// write is accepted for this call. Under store unavailability the
    /// resource's policy decides between denying the call and admitting
    /// it unmetered.
    pub async fn acquire(&self, request: Acquire) -> Result<Lease<S>> {
        if request.consume.is_empty() {
            return Err(Error::Configuration("acquire must consume at least one limit".into()));
        }
        if let Some((name, _)) = request.consume.iter().find(|(_, tokens)| **tokens <= 0) {
            return Err(Error::Configuration(format!(
                "consume amount for '{name}' must be positive"
            )));
        }

        let resolved = match self.resolve_for(&request).await {
            Ok(resolved) => resolved,
            Err(e @ Error::StoreUnavailable { .. }) => {
                return self.admit_on_unavailable(&request, None, e);
            }
            Err(e) => return Err(e),
        };

        for name in request.consume.keys() {
            if name.is_reserved() {
                return Err(Error::Configuration("cannot consume the reserved limit".into()));
            }
            if !resolved.limits.contains_key(name) {
                return Err(Error::Configuration(format!(
                    "no limit named '{name}' configured for resource '{}'",
                    request.resource
                )));
            }
        }

        let consume_milli = request
            .consume
            .iter()
            .map(|(name, tokens)| (name.clone(), tokens * MILLI))
            .collect();
        let run = AcquireRun {
            core: &self.core,
            entity_id: &request.entity_id,
            resource: &request.resource,
            consume_milli,
            config: resolved.clone(),
        };
        match run.acquire().await {
            Err(e @ Error::StoreUnavailable { .. }) => {
                self.admit_on_unavailable(&request, Some(resolved.as_ref()), e)
            }
            other => other,
        }
    }

    /// Runs `f` under a lease: commits on `Ok`, rolls back on `Err`.
    ///
    /// The outer `Result` is the limiter's (acquire or commit failure);
    /// the inner one is the closure's own outcome, passed through
    /// untouched — a rollback failure is logged, never substituted for
    /// the closure's error.
    pub async fn acquire_scoped<T, E, F>(
        &self,
        request: Acquire,
        f: F,
    ) -> Result<std::result::Result<T, E>>
    where
        F: for<'a> FnOnce(&'a Lease<S>) -> BoxFuture<'a, std::result::Result<T, E>>,
    {
        let lease = self.acquire(request).await?;
        match f(&lease).await {
            Ok(value) => {
                lease.release().await?;
                Ok(Ok(value))
            }
            Err(e) => {
                lease.rollback_logged().await;
                Ok(Err(e))
            }
        }
    }

    /// Currently available whole tokens per limit, summed across shards.
    /// The reserved write-capacity limit is never reported.
    pub async fn available(
        &self,
        entity_id: &str,
        resource: &str,
    ) -> Result<IndexMap<LimitName, i64>> {
        let resolved = self
            .core
            .resolve_config(entity_id, resource)
            .await?
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no limits configured for '{entity_id}' on '{resource}'"
                ))
            })?;

        // Shard 0 is authoritative for the layout; reading it first keeps
        // the sum from missing shards the cache has not seen yet.
        let ns = &self.core.ns;
        let shard0 = keys::bucket(ns, entity_id, resource, 0);
        let mut shard_count = self.core.entities.shard_count(ns, entity_id, resource);
        let mut shard0_state = None;
        if let Some(item) = self.core.repo.read_bucket(&shard0).await? {
            let state = BucketState::decode(&shard0, &item)?;
            shard_count = shard_count.max(state.shard_count);
            self.core
                .entities
                .note_shard_count(ns, entity_id, resource, state.shard_count);
            shard0_state = Some(state);
        }

        let rest: Vec<_> = (1..shard_count)
            .map(|shard| keys::bucket(ns, entity_id, resource, shard))
            .collect();
        let mut states: Vec<Option<BucketState>> = vec![shard0_state];
        if !rest.is_empty() {
            for (key, item) in rest.iter().zip(self.core.repo.read_buckets(&rest).await?) {
                states.push(item.map(|i| BucketState::decode(key, &i)).transpose()?);
            }
        }

        let now = self.core.time.now_ms();
        let mut out = IndexMap::with_capacity(resolved.limits.len());
        for (name, limit) in &resolved.limits {
            let (cp_s, ra_s) = bucket::shard_limit(limit, shard_count);
            let mut total_milli = 0;
            for state in &states {
                total_milli += match state.as_ref().and_then(|s| s.limit(name).map(|c| (s, c))) {
                    Some((state, counters)) => {
                        let (tokens, _) = kernel::refill(
                            counters.tokens,
                            state.last_refill_ms,
                            now,
                            counters.capacity,
                            ra_s,
                            limit.refill_period_ms,
                        );
                        tokens
                    }
                    // A shard that does not exist yet holds its full
                    // capacity.
                    None => cp_s,
                };
            }
            out.insert(name.clone(), total_milli / MILLI);
        }
        Ok(out)
    }

    // --- governance -----------------------------------------------------

    /// Creates an entity. The parent, when declared, must already exist;
    /// cascade without a parent is rejected.
    pub async fn create_entity(&self, mut entity: Entity) -> Result<Entity> {
        if entity.id.is_empty() {
            return Err(Error::Configuration("entity id must not be empty".into()));
        }
        if entity.cascade && entity.parent_id.is_none() {
            return Err(Error::Configuration(
                "cascade requires a parent entity".into(),
            ));
        }
        if let Some(parent_id) = &entity.parent_id {
            self.core
                .repo
                .get_entity(&self.core.ns, parent_id)
                .await?
                .ok_or_else(|| Error::ParentNotFound(parent_id.clone()))?;
        }

        entity.created_ms = self.core.time.now_ms();
        self.core.repo.put_entity(&self.core.ns, &entity, true).await?;
        self.core.entities.store_meta(
            &self.core.ns,
            &entity.id,
            EntityMeta { cascade: entity.cascade, parent_id: entity.parent_id.clone() },
        );
        self.audit(&entity.id, AuditAction::EntityCreated, HashMap::new()).await;
        Ok(entity)
    }

    /// Reads an entity's record.
    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        self.core.repo.get_entity(&self.core.ns, entity_id).await
    }

    /// Replaces an entity's metadata. `cascade` and `parent_id` are
    /// immutable for a living entity: changing the hierarchy means
    /// deleting and recreating the entity.
    pub async fn update_entity(
        &self,
        entity_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Entity> {
        let mut entity = self
            .core
            .repo
            .get_entity(&self.core.ns, entity_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_owned()))?;
        entity.metadata = metadata;
        self.core.repo.put_entity(&self.core.ns, &entity, false).await?;
        self.audit(entity_id, AuditAction::EntityUpdated, HashMap::new()).await;
        Ok(entity)
    }

    /// Deletes an entity and everything it owns: buckets, entity-scoped
    /// configs, usage snapshots, and its audit trail. A final tombstone
    /// audit event records the deletion until its TTL expires.
    pub async fn delete_entity(&self, entity_id: &str) -> Result<()> {
        self.core
            .repo
            .get_entity(&self.core.ns, entity_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_owned()))?;

        self.core.repo.delete_entity_records(&self.core.ns, entity_id).await?;
        self.core.entities.invalidate(&self.core.ns, entity_id);
        self.core
            .configs
            .invalidate(&self.core.ns, &ConfigScope::EntityDefault(entity_id.to_owned()));
        self.audit(entity_id, AuditAction::EntityDeleted, HashMap::new()).await;
        Ok(())
    }

    /// Writes a limit config record at a scope and returns its new
    /// version. Entity-scoped records require the entity to exist.
    pub async fn set_config(
        &self,
        scope: ConfigScope,
        limits: Vec<Limit>,
        on_unavailable: OnUnavailable,
    ) -> Result<i64> {
        if limits.is_empty() {
            return Err(Error::Configuration("a config record needs at least one limit".into()));
        }
        if let ConfigScope::EntityDefault(entity_id)
        | ConfigScope::EntityResource { entity_id, .. } = &scope
        {
            self.core
                .repo
                .get_entity(&self.core.ns, entity_id)
                .await?
                .ok_or_else(|| Error::EntityNotFound(entity_id.clone()))?;
        }

        let sets = config::encode_config(&limits, on_unavailable);
        let version = self.core.repo.write_config(&self.core.ns, &scope, sets).await?;
        self.core.configs.invalidate(&self.core.ns, &scope);
        self.audit(
            audit_subject(&scope),
            AuditAction::ConfigSet,
            HashMap::from([("version".to_owned(), version.to_string())]),
        )
        .await;
        Ok(version)
    }

    /// Deletes the config record at a scope.
    pub async fn delete_config(&self, scope: ConfigScope) -> Result<()> {
        self.core.repo.delete_config(&self.core.ns, &scope).await?;
        self.core.configs.invalidate(&self.core.ns, &scope);
        self.audit(audit_subject(&scope), AuditAction::ConfigDeleted, HashMap::new()).await;
        Ok(())
    }

    /// The resolution currently in effect for an (entity, resource), if
    /// any level is configured.
    pub async fn resolve_limits(
        &self,
        entity_id: &str,
        resource: &str,
    ) -> Result<Option<Arc<ResolvedConfig>>> {
        self.core.resolve_config(entity_id, resource).await
    }

    /// The audit trail of an entity, oldest first.
    pub async fn audit_trail(&self, entity_id: &str) -> Result<Vec<audit::AuditEvent>> {
        let pk = keys::audit_pk(&self.core.ns, entity_id);
        let items = self.core.repo.query_items(&pk, "#AUDIT#").await?;
        let mut events: Vec<_> = items
            .iter()
            .filter_map(|(key, item)| {
                let mut event = audit::AuditEvent::decode(item)?;
                event.event_id = key.sk.strip_prefix("#AUDIT#").unwrap_or_default().to_owned();
                Some(event)
            })
            .collect();
        events.sort_by_key(|e| e.at_ms);
        Ok(events)
    }

    /// Usage snapshot windows for an (entity, resource), oldest first.
    /// Materialized by the aggregator; empty until it has run.
    pub async fn usage(
        &self,
        entity_id: &str,
        resource: &str,
    ) -> Result<Vec<crate::aggregator::UsageWindow>> {
        let pk = keys::entity_meta(&self.core.ns, entity_id).pk;
        let items = self
            .core
            .repo
            .query_items(&pk, &keys::usage_sk_prefix(resource))
            .await?;
        let mut windows: Vec<_> = items
            .iter()
            .filter_map(|(key, item)| crate::aggregator::UsageWindow::decode(key, item))
            .collect();
        windows.sort_by_key(|w| (w.start_ms, w.window));
        Ok(windows)
    }

    // --- internals ------------------------------------------------------

    async fn resolve_for(&self, request: &Acquire) -> Result<Arc<ResolvedConfig>> {
        if let Some(resolved) = self
            .core
            .resolve_config(&request.entity_id, &request.resource)
            .await?
        {
            return Ok(resolved);
        }
        match &request.limits {
            Some(limits) => Ok(Arc::new(ResolvedConfig::explicit(
                limits.clone(),
                OnUnavailable::default(),
            )?)),
            None => Err(Error::Configuration(format!(
                "no limits configured for '{}' on '{}' and none supplied",
                request.entity_id, request.resource
            ))),
        }
    }

    /// Applies the fail-open/fail-closed policy to a store failure.
    fn admit_on_unavailable(
        &self,
        request: &Acquire,
        resolved: Option<&ResolvedConfig>,
        err: Error,
    ) -> Result<Lease<S>> {
        match self.core.unavailable_policy(resolved, &request.resource) {
            OnUnavailable::FailOpen => {
                tracing::warn!(
                    entity = %request.entity_id,
                    resource = %request.resource,
                    error = %err,
                    "store unavailable; admitting unmetered under fail-open policy"
                );
                Ok(Lease::unmetered(
                    self.core.clone(),
                    request.entity_id.clone(),
                    request.resource.clone(),
                ))
            }
            OnUnavailable::FailClosed => Err(err),
        }
    }

    /// Best-effort audit append; governance never fails on audit I/O.
    async fn audit(&self, subject: &str, action: AuditAction, detail: HashMap<String, String>) {
        let event = audit::AuditEvent::new(action, subject, detail, self.core.time.now_ms());
        let key = keys::audit(&self.core.ns, subject, &event.event_id);
        if let Err(e) = self.core.repo.append_audit(&key, event.encode()).await {
            tracing::warn!(subject, error = %e, "audit append failed");
        }
    }
}

/// The audit partition a config scope's events land on.
fn audit_subject(scope: &ConfigScope) -> &str {
    match scope {
        ConfigScope::System | ConfigScope::Resource(_) => "_system_",
        ConfigScope::EntityDefault(entity_id)
        | ConfigScope::EntityResource { entity_id, .. } => entity_id,
    }
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder<S> {
    store: S,
    namespace: String,
    speculate: bool,
    config_ttl: Duration,
    retry: RetryPolicy,
    time: Arc<dyn TimeSource>,
    unavailable_overrides: HashMap<String, OnUnavailable>,
}

impl<S: Store> LimiterBuilder<S> {
    /// Creates a builder with the defaults: namespace `default`, slow
    /// acquires only, 60 s config cache, three store attempts.
    pub fn new(store: S) -> Self {
        Self {
            store,
            namespace: "default".into(),
            speculate: false,
            config_ttl: DEFAULT_CONFIG_TTL,
            retry: RetryPolicy::default(),
            time: Arc::new(SystemTimeSource),
            unavailable_overrides: HashMap::new(),
        }
    }

    /// Binds the limiter to a namespace id (see
    /// [`NamespaceRegistry`](crate::NamespaceRegistry)).
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Enables the speculative fast path: acquires decide admission with
    /// a conditional write instead of a read round-trip.
    pub fn with_speculation(mut self) -> Self {
        self.speculate = true;
        self
    }

    /// Overrides the config cache TTL.
    pub fn config_ttl(mut self, ttl: Duration) -> Self {
        self.config_ttl = ttl;
        self
    }

    /// Overrides the store retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the clock. Intended for deterministic tests.
    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Sets the process-local unavailability policy for one resource,
    /// overriding whatever the config records say.
    pub fn on_unavailable(mut self, resource: impl Into<String>, policy: OnUnavailable) -> Self {
        self.unavailable_overrides.insert(resource.into(), policy);
        self
    }

    /// Builds the limiter.
    pub fn build(self) -> Limiter<S> {
        let time = self.time.clone();
        Limiter {
            core: Arc::new(Core {
                repo: Repository::new(self.store, self.retry),
                ns: self.namespace,
                configs: ConfigCache::new(self.config_ttl, time.clone()),
                entities: EntityCache::new(),
                time,
                speculate: self.speculate,
                unavailable_overrides: self.unavailable_overrides,
            }),
        }
    }
}
