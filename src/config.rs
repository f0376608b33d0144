//! Limit configuration: records, resolution, and the in-process cache.
//!
//! Limits can be configured at four scopes. Resolution walks them in
//! precedence order — entity-resource, entity-default, resource, system —
//! and the first scope with a record wins *entirely*; limits are never
//! merged across scopes. Config records use flat attribute encoding
//! (`l_{limit}_{cp|ra|rp}`) and carry a monotonic `config_version` that
//! increments on every write, which lets cache holders detect staleness
//! without re-reading the full record.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::kernel::TimeSource;
use crate::keys::{self, ATTR_CONFIG_VERSION, ATTR_SCHEMA, ConfigParam, ItemKey};
use crate::limits::{Limit, LimitSet, limit_set};
use crate::store::{AttrValue, Item, get_n, get_s};

/// Schema version this client reads and writes.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// Default time-to-live of cached resolutions.
pub(crate) const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(60);

/// Attribute holding the unavailability policy on a config record.
const ATTR_ON_UNAVAILABLE: &str = "on_unavailable";

/// What an acquire does when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUnavailable {
    /// Deny the call. The safe default.
    #[default]
    FailClosed,

    /// Admit the call unmetered, with a warning. For resources where
    /// availability matters more than strict enforcement.
    FailOpen,
}

impl OnUnavailable {
    fn as_str(self) -> &'static str {
        match self {
            OnUnavailable::FailClosed => "closed",
            OnUnavailable::FailOpen => "open",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(OnUnavailable::FailClosed),
            "open" => Some(OnUnavailable::FailOpen),
            _ => None,
        }
    }
}

/// One of the four configuration scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigScope {
    /// Applies to every entity and resource in the namespace.
    System,

    /// Applies to every entity using the named resource.
    Resource(String),

    /// Applies to one entity across all of its resources.
    EntityDefault(String),

    /// Applies to one entity on one resource. Highest precedence.
    EntityResource {
        entity_id: String,
        resource: String,
    },
}

impl ConfigScope {
    /// The record key of this scope within a namespace.
    pub(crate) fn key(&self, ns: &str) -> ItemKey {
        match self {
            ConfigScope::System => keys::system_config(ns),
            ConfigScope::Resource(resource) => keys::resource_config(ns, resource),
            ConfigScope::EntityDefault(entity_id) => keys::entity_default_config(ns, entity_id),
            ConfigScope::EntityResource { entity_id, resource } => {
                keys::entity_config(ns, entity_id, resource)
            }
        }
    }
}

/// Which scope a resolution was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLevel {
    /// Entity-resource record.
    EntityResource,
    /// Entity-default record.
    EntityDefault,
    /// Resource record.
    Resource,
    /// System record.
    System,
    /// Limits supplied by the caller on the acquire itself.
    Explicit,
}

/// The outcome of config resolution for one (entity, resource).
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The winning limits, keyed by name. Never contains `wcu`.
    pub limits: LimitSet,

    /// Unavailability policy of the winning record.
    pub on_unavailable: OnUnavailable,

    /// Which scope won.
    pub level: ConfigLevel,

    /// `config_version` of the winning record; 0 for explicit limits.
    pub version: i64,
}

impl ResolvedConfig {
    /// Wraps caller-supplied limits as a resolution.
    pub(crate) fn explicit(limits: Vec<Limit>, on_unavailable: OnUnavailable) -> Result<Self> {
        Ok(Self {
            limits: limit_set(limits)?,
            on_unavailable,
            level: ConfigLevel::Explicit,
            version: 0,
        })
    }
}

/// Encodes limits and policy into the SET actions of a config write.
/// The version counter is bumped separately, with an ADD.
pub(crate) fn encode_config(
    limits: &[Limit],
    on_unavailable: OnUnavailable,
) -> Vec<(String, AttrValue)> {
    let mut sets = Vec::with_capacity(limits.len() * 3 + 2);
    for limit in limits {
        let name = limit.name.as_str();
        sets.push((keys::config_attr(name, ConfigParam::Capacity), AttrValue::N(limit.capacity_milli)));
        sets.push((keys::config_attr(name, ConfigParam::RefillAmount), AttrValue::N(limit.refill_amount_milli)));
        sets.push((keys::config_attr(name, ConfigParam::RefillPeriod), AttrValue::N(limit.refill_period_ms)));
    }
    sets.push((ATTR_ON_UNAVAILABLE.into(), AttrValue::S(on_unavailable.as_str().into())));
    sets.push((ATTR_SCHEMA.into(), AttrValue::N(i64::from(SCHEMA_VERSION))));
    sets
}

/// Decodes a config record into `(limits, policy, version)`.
///
/// A record written by a newer deployment is surfaced as
/// [`Error::VersionMismatch`] rather than misread.
pub(crate) fn decode_config(item: &Item) -> Result<(Vec<Limit>, OnUnavailable, i64)> {
    if let Some(schema) = get_n(item, ATTR_SCHEMA) {
        let actual = u32::try_from(schema).unwrap_or(u32::MAX);
        if actual != SCHEMA_VERSION {
            return Err(Error::VersionMismatch { expected: SCHEMA_VERSION, actual });
        }
    }

    let mut partial: indexmap::IndexMap<String, (Option<i64>, Option<i64>, Option<i64>)> =
        indexmap::IndexMap::new();
    for (attr, value) in item {
        let Some((limit, param)) = keys::parse_config_attr(attr) else {
            continue;
        };
        let n = value
            .as_n()
            .ok_or_else(|| Error::Internal(format!("non-integer config attribute: {attr}")))?;
        let entry = partial.entry(limit.to_owned()).or_default();
        match param {
            ConfigParam::Capacity => entry.0 = Some(n),
            ConfigParam::RefillAmount => entry.1 = Some(n),
            ConfigParam::RefillPeriod => entry.2 = Some(n),
        }
    }

    let mut limits = Vec::with_capacity(partial.len());
    for (name, (cp, ra, rp)) in partial {
        let (Some(cp), Some(ra), Some(rp)) = (cp, ra, rp) else {
            return Err(Error::Internal(format!("incomplete config for limit '{name}'")));
        };
        limits.push(Limit::new(name, cp, ra, rp)?);
    }

    let on_unavailable = get_s(item, ATTR_ON_UNAVAILABLE)
        .and_then(OnUnavailable::parse)
        .unwrap_or_default();
    let version = get_n(item, ATTR_CONFIG_VERSION).unwrap_or_default();
    Ok((limits, on_unavailable, version))
}

/// Resolves the four candidate records, highest precedence first. The
/// first present record wins entirely; `None` means nothing is configured
/// at any level.
pub(crate) fn resolve(candidates: [Option<&Item>; 4]) -> Result<Option<ResolvedConfig>> {
    const LEVELS: [ConfigLevel; 4] = [
        ConfigLevel::EntityResource,
        ConfigLevel::EntityDefault,
        ConfigLevel::Resource,
        ConfigLevel::System,
    ];

    for (item, level) in candidates.into_iter().zip(LEVELS) {
        let Some(item) = item else {
            continue;
        };
        let (limits, on_unavailable, version) = decode_config(item)?;
        return Ok(Some(ResolvedConfig {
            limits: limit_set(limits)?,
            on_unavailable,
            level,
            version,
        }));
    }
    Ok(None)
}

#[derive(Clone)]
struct CachedConfig {
    resolved: Arc<ResolvedConfig>,
    fetched_ms: i64,
}

/// Bounded-staleness cache of resolutions, keyed by
/// (namespace, entity, resource).
///
/// Entries expire after a TTL; local mutations invalidate the affected
/// scopes immediately, while other processes converge through expiry. The
/// aggregator additionally invalidates when it observes a config change
/// in the feed, so long-lived processes refresh ahead of the TTL.
pub(crate) struct ConfigCache {
    entries: DashMap<(String, String, String), CachedConfig>,
    ttl_ms: i64,
    time: Arc<dyn TimeSource>,
}

impl ConfigCache {
    pub(crate) fn new(ttl: Duration, time: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            time,
        }
    }

    /// A live cached resolution, if present and within TTL.
    pub(crate) fn get(&self, ns: &str, entity_id: &str, resource: &str) -> Option<Arc<ResolvedConfig>> {
        let key = (ns.to_owned(), entity_id.to_owned(), resource.to_owned());
        let entry = self.entries.get(&key)?;
        if self.time.now_ms() - entry.fetched_ms >= self.ttl_ms {
            drop(entry);
            self.entries.remove(&key);
            tracing::trace!(entity = entity_id, resource, "config cache expired");
            return None;
        }
        tracing::trace!(entity = entity_id, resource, "config cache hit");
        Some(entry.resolved.clone())
    }

    pub(crate) fn insert(&self, ns: &str, entity_id: &str, resource: &str, resolved: Arc<ResolvedConfig>) {
        tracing::debug!(entity = entity_id, resource, "config cache store");
        self.entries.insert(
            (ns.to_owned(), entity_id.to_owned(), resource.to_owned()),
            CachedConfig { resolved, fetched_ms: self.time.now_ms() },
        );
    }

    /// Drops every cached resolution a mutation at `scope` could affect.
    pub(crate) fn invalidate(&self, ns: &str, scope: &ConfigScope) {
        match scope {
            ConfigScope::System => self.entries.retain(|(n, _, _), _| n != ns),
            ConfigScope::Resource(resource) => {
                self.entries.retain(|(n, _, r), _| n != ns || r != resource);
            }
            ConfigScope::EntityDefault(entity_id) => {
                self.entries.retain(|(n, e, _), _| n != ns || e != entity_id);
            }
            ConfigScope::EntityResource { entity_id, resource } => {
                self.entries.remove(&(ns.to_owned(), entity_id.clone(), resource.clone()));
            }
        }
    }

    /// Drops entries whose winning record is older than an observed
    /// version. Called from the aggregator when the feed shows a config
    /// write.
    pub(crate) fn note_version(&self, ns: &str, scope: &ConfigScope, version: i64) {
        let stale = match scope {
            ConfigScope::EntityResource { entity_id, resource } => self
                .entries
                .get(&(ns.to_owned(), entity_id.clone(), resource.clone()))
                .map_or(false, |e| e.resolved.version < version),
            _ => true,
        };
        if stale {
            self.invalidate(ns, scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_utils::MockTimeSource;
    use crate::limits::LimitName;

    fn record(tokens: i64, version: i64) -> Item {
        let limits = vec![Limit::per_period("rpm", tokens, 60_000).unwrap()];
        let mut item: Item = encode_config(&limits, OnUnavailable::default())
            .into_iter()
            .collect();
        item.insert(ATTR_CONFIG_VERSION.into(), AttrValue::N(version));
        item
    }

    #[test]
    fn it_round_trips_config_records() {
        let item = record(100, 3);
        let (limits, policy, version) = decode_config(&item).unwrap();

        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].name, LimitName::Rpm);
        assert_eq!(limits[0].capacity_milli, 100_000);
        assert_eq!(policy, OnUnavailable::FailClosed);
        assert_eq!(version, 3);
    }

    #[test]
    fn it_rejects_newer_schema_records() {
        let mut item = record(100, 1);
        item.insert(ATTR_SCHEMA.into(), AttrValue::N(2));

        match decode_config(&item) {
            Err(Error::VersionMismatch { expected, actual }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(actual, 2);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn it_rejects_incomplete_records() {
        let mut item = record(100, 1);
        item.remove("l_rpm_rp");
        assert!(decode_config(&item).is_err());
    }

    #[test]
    fn it_resolves_the_first_present_level() {
        let entity_res = record(10, 1);
        let system = record(1_000, 9);

        let resolved = resolve([Some(&entity_res), None, None, Some(&system)])
            .unwrap()
            .unwrap();
        assert_eq!(resolved.level, ConfigLevel::EntityResource);
        assert_eq!(resolved.limits[&LimitName::Rpm].capacity_milli, 10_000);

        // No per-limit merging: the winning record is taken entirely.
        let resolved = resolve([None, None, None, Some(&system)]).unwrap().unwrap();
        assert_eq!(resolved.level, ConfigLevel::System);
        assert_eq!(resolved.limits[&LimitName::Rpm].capacity_milli, 1_000_000);

        assert!(resolve([None, None, None, None]).unwrap().is_none());
    }

    #[test]
    fn it_expires_cache_entries_after_ttl() {
        let clock = MockTimeSource::new(0);
        let cache = ConfigCache::new(Duration::from_secs(60), Arc::new(clock.clone()));
        let resolved = Arc::new(
            ResolvedConfig::explicit(
                vec![Limit::per_period("rpm", 100, 60_000).unwrap()],
                OnUnavailable::default(),
            )
            .unwrap(),
        );

        cache.insert("ns", "e", "r", resolved);
        assert!(cache.get("ns", "e", "r").is_some());

        clock.advance(59_999);
        assert!(cache.get("ns", "e", "r").is_some());

        clock.advance(1);
        assert!(cache.get("ns", "e", "r").is_none());
    }

    #[test]
    fn it_invalidates_by_scope() {
        let clock = MockTimeSource::new(0);
        let cache = ConfigCache::new(Duration::from_secs(60), Arc::new(clock));
        let resolved = Arc::new(
            ResolvedConfig::explicit(
                vec![Limit::per_period("rpm", 100, 60_000).unwrap()],
                OnUnavailable::default(),
            )
            .unwrap(),
        );

        cache.insert("ns", "e1", "r1", resolved.clone());
        cache.insert("ns", "e1", "r2", resolved.clone());
        cache.insert("ns", "e2", "r1", resolved.clone());

        cache.invalidate("ns", &ConfigScope::EntityDefault("e1".into()));
        assert!(cache.get("ns", "e1", "r1").is_none());
        assert!(cache.get("ns", "e1", "r2").is_none());
        assert!(cache.get("ns", "e2", "r1").is_some());

        cache.insert("ns", "e1", "r1", resolved.clone());
        cache.invalidate("ns", &ConfigScope::Resource("r1".into()));
        assert!(cache.get("ns", "e1", "r1").is_none());
        assert!(cache.get("ns", "e2", "r1").is_none());
    }

    #[test]
    fn it_drops_stale_versions_only() {
        let clock = MockTimeSource::new(0);
        let cache = ConfigCache::new(Duration::from_secs(60), Arc::new(clock));
        let mut resolved = ResolvedConfig::explicit(
            vec![Limit::per_period("rpm", 100, 60_000).unwrap()],
            OnUnavailable::default(),
        )
        .unwrap();
        resolved.version = 5;
        let scope = ConfigScope::EntityResource { entity_id: "e".into(), resource: "r".into() };

        cache.insert("ns", "e", "r", Arc::new(resolved));
        cache.note_version("ns", &scope, 5);
        assert!(cache.get("ns", "e", "r").is_some());

        cache.note_version("ns", &scope, 6);
        assert!(cache.get("ns", "e", "r").is_none());
    }
}
