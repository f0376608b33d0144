//! Limit descriptors and naming.
//!
//! A [`Limit`] is a pure descriptor: name, capacity, and refill rate, all
//! in integer millitokens. The descriptor carries no runtime state — the
//! counters live in the composite bucket records.
//!
//! Limits are name-keyed on the wire. [`LimitName`] keeps the canonical
//! LLM-shaped names (`rpm`, `tpm`) as cheap enum variants and carries
//! user-defined names as interned strings, so a custom dimension costs one
//! allocation at construction and nothing per comparison.

use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::kernel::MILLI;

/// Name of the reserved write-capacity limit.
pub(crate) const WCU: &str = "wcu";

/// Millitokens one guarded write costs against the `wcu` limit.
pub(crate) const WCU_COST_MILLI: i64 = MILLI;

/// A rate limit dimension name.
///
/// Canonical names compare without allocation; anything else is carried as
/// an interned string. The on-wire encoding is the raw name string in both
/// directions. Equality and hashing go through the wire string, so the
/// name can key maps that are also looked up by `&str`.
#[derive(Debug, Clone)]
pub enum LimitName {
    /// Requests per minute.
    Rpm,

    /// Tokens per minute.
    Tpm,

    /// Reserved per-shard write-capacity limit. Never user-visible.
    Wcu,

    /// Any user-defined dimension.
    Custom(Arc<str>),
}

impl LimitName {
    /// The wire representation of this name.
    #[inline]
    pub fn as_str(&self) -> &str {
        match self {
            LimitName::Rpm => "rpm",
            LimitName::Tpm => "tpm",
            LimitName::Wcu => WCU,
            LimitName::Custom(name) => name,
        }
    }

    /// Whether this is the reserved, hidden write-capacity limit.
    #[inline]
    pub(crate) fn is_reserved(&self) -> bool {
        matches!(self, LimitName::Wcu)
    }
}

impl From<&str> for LimitName {
    #[inline]
    fn from(name: &str) -> Self {
        match name {
            "rpm" => LimitName::Rpm,
            "tpm" => LimitName::Tpm,
            WCU => LimitName::Wcu,
            custom => LimitName::Custom(custom.into()),
        }
    }
}

impl From<String> for LimitName {
    #[inline]
    fn from(name: String) -> Self {
        name.as_str().into()
    }
}

impl PartialEq for LimitName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for LimitName {}

impl std::hash::Hash for LimitName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl Display for LimitName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Borrow<str> for LimitName {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// A single limit descriptor.
///
/// All quantities are integer millitokens; `refill_period_ms` is
/// milliseconds. `refill_amount_milli` millitokens are emitted per
/// `refill_period_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    /// The dimension this limit constrains.
    pub name: LimitName,

    /// Burst capacity, millitokens.
    pub capacity_milli: i64,

    /// Millitokens emitted per refill period.
    pub refill_amount_milli: i64,

    /// Refill period, milliseconds.
    pub refill_period_ms: i64,
}

impl Limit {
    /// Creates a limit descriptor, validating its parameters.
    ///
    /// Zero or negative refill amount or period would divide by zero in
    /// the arithmetic kernel, so both are rejected here, at construction.
    pub fn new(
        name: impl Into<LimitName>,
        capacity_milli: i64,
        refill_amount_milli: i64,
        refill_period_ms: i64,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_reserved() {
            return Err(Error::Configuration(format!(
                "limit name '{WCU}' is reserved"
            )));
        }
        if capacity_milli < 0 {
            return Err(Error::Configuration(format!(
                "limit '{name}': capacity must not be negative"
            )));
        }
        if refill_amount_milli <= 0 {
            return Err(Error::Configuration(format!(
                "limit '{name}': refill amount must be positive"
            )));
        }
        if refill_period_ms <= 0 {
            return Err(Error::Configuration(format!(
                "limit '{name}': refill period must be positive"
            )));
        }
        Ok(Self { name, capacity_milli, refill_amount_milli, refill_period_ms })
    }

    /// A limit of `tokens` per `period_ms`, with burst capacity equal to
    /// one period's worth. The common shape for `rpm`/`tpm` style limits.
    pub fn per_period(name: impl Into<LimitName>, tokens: i64, period_ms: i64) -> Result<Self> {
        let milli = tokens * MILLI;
        Self::new(name, milli, milli, period_ms)
    }

    /// The reserved per-shard write-capacity limit: 1000 write units of
    /// burst, refilling 1000 units per second. Auto-injected on every
    /// bucket and hidden from all user-facing output.
    pub(crate) fn wcu() -> Self {
        Self {
            name: LimitName::Wcu,
            capacity_milli: 1_000 * MILLI,
            refill_amount_milli: 1_000 * MILLI,
            refill_period_ms: 1_000,
        }
    }
}

/// The amounts an acquire consumes, keyed by limit, in whole tokens.
pub type ConsumeMap = IndexMap<LimitName, i64>;

/// An ordered set of limit descriptors keyed by name.
pub type LimitSet = IndexMap<LimitName, Limit>;

/// Builds a [`LimitSet`] from descriptors, rejecting duplicates.
pub(crate) fn limit_set(limits: Vec<Limit>) -> Result<LimitSet> {
    let mut set = LimitSet::with_capacity(limits.len());
    for limit in limits {
        let name = limit.name.clone();
        if set.insert(name.clone(), limit).is_some() {
            return Err(Error::Configuration(format!("duplicate limit '{name}'")));
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_interns_canonical_names() {
        assert_eq!(LimitName::from("rpm"), LimitName::Rpm);
        assert_eq!(LimitName::from("tpm"), LimitName::Tpm);
        assert_eq!(LimitName::from("wcu"), LimitName::Wcu);
        assert_eq!(LimitName::Rpm.as_str(), "rpm");
    }

    #[test]
    fn it_carries_custom_names() {
        let name = LimitName::from("gpu_seconds");
        assert!(matches!(name, LimitName::Custom(_)));
        assert_eq!(name.as_str(), "gpu_seconds");
        assert_eq!(name, LimitName::from("gpu_seconds".to_owned()));
    }

    #[test]
    fn it_validates_limit_parameters() {
        assert!(Limit::new("rpm", 100_000, 100_000, 60_000).is_ok());
        assert!(Limit::new("rpm", -1, 100_000, 60_000).is_err());
        assert!(Limit::new("rpm", 100_000, 0, 60_000).is_err());
        assert!(Limit::new("rpm", 100_000, 100_000, 0).is_err());
    }

    #[test]
    fn it_rejects_the_reserved_name() {
        let err = Limit::new("wcu", 1_000, 1_000, 1_000).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn it_builds_per_period_limits() {
        let limit = Limit::per_period("rpm", 100, 60_000).unwrap();
        assert_eq!(limit.capacity_milli, 100_000);
        assert_eq!(limit.refill_amount_milli, 100_000);
        assert_eq!(limit.refill_period_ms, 60_000);
    }

    #[test]
    fn it_rejects_duplicate_limits() {
        let limits = vec![
            Limit::per_period("rpm", 100, 60_000).unwrap(),
            Limit::per_period("rpm", 200, 60_000).unwrap(),
        ];
        assert!(limit_set(limits).is_err());
    }

    #[test]
    fn it_keeps_wcu_parameters_fixed() {
        let wcu = Limit::wcu();
        assert_eq!(wcu.capacity_milli, 1_000_000);
        assert_eq!(wcu.refill_amount_milli, 1_000_000);
        assert_eq!(wcu.refill_period_ms, 1_000);
        assert!(wcu.name.is_reserved());
    }
}
