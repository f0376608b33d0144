//! Builders and parsers for composite keys and attribute names.
//!
//! This module owns the wire layout: every partition key is prefixed with
//! the namespace (`{ns}/…`), bucket shards live on their own partition so
//! a hot entity spreads its write pressure, and all counter attributes
//! follow fixed naming patterns. Nothing else in the crate formats or
//! splits a key by hand.
//!
//! | Record            | PK                              | SK                          |
//! |-------------------|---------------------------------|-----------------------------|
//! | Entity meta       | `{ns}/ENTITY#{id}`              | `#META`                     |
//! | Bucket shard      | `{ns}/BUCKET#{id}#{res}#{shard}`| `#STATE`                    |
//! | Entity config     | `{ns}/ENTITY#{id}`              | `#CONFIG#{res}`             |
//! | Resource config   | `{ns}/RESOURCE#{res}`           | `#CONFIG`                   |
//! | System config     | `{ns}/SYSTEM#`                  | `#CONFIG`                   |
//! | Usage snapshot    | `{ns}/ENTITY#{id}`              | `#USAGE#{res}#{window_key}` |
//! | Audit             | `{ns}/AUDIT#{id}`               | `#AUDIT#{event_id}`         |
//! | Namespace forward | `_/SYSTEM#`                     | `#NAMESPACE#{name}`         |
//! | Namespace reverse | `_/SYSTEM#`                     | `#NSID#{id}`                |

use std::fmt::{Display, Formatter};

/// The reserved namespace holding the name ↔ id registry.
pub const RESERVED_NAMESPACE: &str = "_";

/// Sort key of an entity metadata record.
pub const SK_META: &str = "#META";

/// Sort key of a bucket shard record.
pub const SK_STATE: &str = "#STATE";

/// Sort key of a resource-level or system-level config record.
pub const SK_CONFIG: &str = "#CONFIG";

/// Resource placeholder for an entity-default config record.
pub const DEFAULT_RESOURCE: &str = "_default_";

/// Shared refill timestamp attribute on a bucket record.
pub const ATTR_REFILL: &str = "rf";

/// Denormalized cascade flag on a bucket record.
pub const ATTR_CASCADE: &str = "cascade";

/// Denormalized parent id on a bucket record.
pub const ATTR_PARENT: &str = "parent_id";

/// Shard count attribute, authoritative on shard 0.
pub const ATTR_SHARD_COUNT: &str = "shard_count";

/// Monotonic version counter on a config record.
pub const ATTR_CONFIG_VERSION: &str = "config_version";

/// Schema version stamped on config records.
pub const ATTR_SCHEMA: &str = "schema";

/// Per-item expiry attribute, epoch milliseconds.
pub const ATTR_TTL: &str = "ttl";

/// A fully qualified item key: namespace-prefixed partition key plus sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// Partition key, always `{ns}/…`.
    pub pk: String,

    /// Sort key within the partition.
    pub sk: String,
}

impl ItemKey {
    /// Creates a key from raw parts.
    #[inline]
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self { pk: pk.into(), sk: sk.into() }
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.pk, self.sk)
    }
}

/// Key of an entity metadata record.
#[inline]
pub fn entity_meta(ns: &str, entity_id: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), SK_META)
}

/// Key of one bucket shard. Each shard is its own partition.
#[inline]
pub fn bucket(ns: &str, entity_id: &str, resource: &str, shard: u32) -> ItemKey {
    ItemKey::new(format!("{ns}/BUCKET#{entity_id}#{resource}#{shard}"), SK_STATE)
}

/// Partition-key prefix covering every bucket shard of an entity,
/// across all resources. Used for discovery and purge scans.
#[inline]
pub fn bucket_pk_prefix(ns: &str, entity_id: &str) -> String {
    format!("{ns}/BUCKET#{entity_id}#")
}

/// Key of an entity-scoped config record for one resource.
#[inline]
pub fn entity_config(ns: &str, entity_id: &str, resource: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/ENTITY#{entity_id}"), format!("{SK_CONFIG}#{resource}"))
}

/// Key of an entity-default config record, consulted for every resource
/// without a dedicated entity-resource config.
#[inline]
pub fn entity_default_config(ns: &str, entity_id: &str) -> ItemKey {
    entity_config(ns, entity_id, DEFAULT_RESOURCE)
}

/// Key of a resource-level config record.
#[inline]
pub fn resource_config(ns: &str, resource: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/RESOURCE#{resource}"), SK_CONFIG)
}

/// Key of the system-level config record.
#[inline]
pub fn system_config(ns: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/SYSTEM#"), SK_CONFIG)
}

/// Key of a usage snapshot window.
#[inline]
pub fn usage(ns: &str, entity_id: &str, resource: &str, window_key: &str) -> ItemKey {
    ItemKey::new(
        format!("{ns}/ENTITY#{entity_id}"),
        format!("#USAGE#{resource}#{window_key}"),
    )
}

/// Sort-key prefix covering every usage snapshot of a resource.
#[inline]
pub fn usage_sk_prefix(resource: &str) -> String {
    format!("#USAGE#{resource}#")
}

/// Key of an audit event.
#[inline]
pub fn audit(ns: &str, entity_id: &str, event_id: &str) -> ItemKey {
    ItemKey::new(format!("{ns}/AUDIT#{entity_id}"), format!("#AUDIT#{event_id}"))
}

/// Partition key holding an entity's audit trail.
#[inline]
pub fn audit_pk(ns: &str, entity_id: &str) -> String {
    format!("{ns}/AUDIT#{entity_id}")
}

/// Forward registry key: human name → namespace id.
#[inline]
pub fn namespace_forward(name: &str) -> ItemKey {
    ItemKey::new(format!("{RESERVED_NAMESPACE}/SYSTEM#"), format!("#NAMESPACE#{name}"))
}

/// Reverse registry key: namespace id → human name.
#[inline]
pub fn namespace_reverse(ns_id: &str) -> ItemKey {
    ItemKey::new(format!("{RESERVED_NAMESPACE}/SYSTEM#"), format!("#NSID#{ns_id}"))
}

/// Partition-key prefix covering every record of a namespace.
#[inline]
pub fn namespace_pk_prefix(ns: &str) -> String {
    format!("{ns}/")
}

/// Bucket counter columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCol {
    /// Current token balance, millitokens. May be negative.
    Tokens,
    /// Shard-effective capacity, millitokens.
    Capacity,
    /// Monotonic net consumption, millitokens.
    Consumed,
}

impl BucketCol {
    #[inline]
    fn suffix(self) -> &'static str {
        match self {
            BucketCol::Tokens => "tk",
            BucketCol::Capacity => "cp",
            BucketCol::Consumed => "tc",
        }
    }
}

/// Attribute name of a bucket counter: `b_{limit}_{tk|cp|tc}`.
#[inline]
pub fn bucket_attr(limit: &str, col: BucketCol) -> String {
    format!("b_{limit}_{}", col.suffix())
}

/// Splits a bucket counter attribute back into `(limit, column)`.
pub fn parse_bucket_attr(attr: &str) -> Option<(&str, BucketCol)> {
    let rest = attr.strip_prefix("b_")?;
    let (limit, suffix) = rest.rsplit_once('_')?;
    let col = match suffix {
        "tk" => BucketCol::Tokens,
        "cp" => BucketCol::Capacity,
        "tc" => BucketCol::Consumed,
        _ => return None,
    };
    if limit.is_empty() {
        return None;
    }
    Some((limit, col))
}

/// Limit parameters within a config record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParam {
    /// Capacity, millitokens.
    Capacity,
    /// Refill amount, millitokens per period.
    RefillAmount,
    /// Refill period, milliseconds.
    RefillPeriod,
}

impl ConfigParam {
    #[inline]
    fn suffix(self) -> &'static str {
        match self {
            ConfigParam::Capacity => "cp",
            ConfigParam::RefillAmount => "ra",
            ConfigParam::RefillPeriod => "rp",
        }
    }
}

/// Attribute name of a config parameter: `l_{limit}_{cp|ra|rp}`.
#[inline]
pub fn config_attr(limit: &str, param: ConfigParam) -> String {
    format!("l_{limit}_{}", param.suffix())
}

/// Splits a config parameter attribute back into `(limit, param)`.
pub fn parse_config_attr(attr: &str) -> Option<(&str, ConfigParam)> {
    let rest = attr.strip_prefix("l_")?;
    let (limit, suffix) = rest.rsplit_once('_')?;
    let param = match suffix {
        "cp" => ConfigParam::Capacity,
        "ra" => ConfigParam::RefillAmount,
        "rp" => ConfigParam::RefillPeriod,
        _ => return None,
    };
    if limit.is_empty() {
        return None;
    }
    Some((limit, param))
}

/// Usage snapshot counter attribute: `u_{limit}`.
#[inline]
pub fn usage_attr(limit: &str) -> String {
    format!("u_{limit}")
}

/// Splits a usage counter attribute back into the limit name.
#[inline]
pub fn parse_usage_attr(attr: &str) -> Option<&str> {
    attr.strip_prefix("u_").filter(|l| !l.is_empty())
}

/// Components of a bucket partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub namespace: String,
    pub entity_id: String,
    pub resource: String,
    pub shard: u32,
}

/// Parses a bucket partition key back into its components.
///
/// Entity ids may contain `#`; resources and shard numbers may not, so the
/// split anchors on the two rightmost separators.
pub fn parse_bucket_pk(pk: &str) -> Option<BucketRef> {
    let (namespace, rest) = pk.split_once('/')?;
    let rest = rest.strip_prefix("BUCKET#")?;
    let (rest, shard) = rest.rsplit_once('#')?;
    let (entity_id, resource) = rest.rsplit_once('#')?;
    if entity_id.is_empty() || resource.is_empty() {
        return None;
    }
    Some(BucketRef {
        namespace: namespace.to_owned(),
        entity_id: entity_id.to_owned(),
        resource: resource.to_owned(),
        shard: shard.parse().ok()?,
    })
}

/// Parses an entity partition key (`{ns}/ENTITY#{id}`) into `(ns, id)`.
pub fn parse_entity_pk(pk: &str) -> Option<(&str, &str)> {
    let (namespace, rest) = pk.split_once('/')?;
    let entity_id = rest.strip_prefix("ENTITY#")?;
    if entity_id.is_empty() {
        return None;
    }
    Some((namespace, entity_id))
}
