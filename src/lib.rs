//! # Weir
//!
//! > Hierarchical, multi-dimensional distributed rate limiting on top of a
//! > keyed store, built on the [Tokio](https://tokio.rs/) runtime.
//!
//! Weir enforces limits on operations whose true cost is only known after
//! they complete — the canonical example being LLM API calls, where token
//! counts arrive with the response. Many independent processes share one
//! consistent view of consumption through the backing store; the store's
//! conditional writes decide admission, so no coordinator process exists.
//!
//! ## Features
//! * Composite token buckets: any number of named limits per (entity, resource)
//! * Hierarchies: child entities that cascade consumption into a parent
//! * Scoped leases with write-on-enter, post-completion adjustment, and rollback
//! * A speculative write-first fast path that skips the read round trip
//! * Pre-sharded buckets that spread hot entities across store partitions
//! * Four-level limit configuration with cached, batched resolution
//! * A background aggregator for proactive refills, resharding, and usage snapshots
//! * Runs on stable Rust 1.80+
//!
//! ## Example
//! ```no_run
//! use weir::{Acquire, Entity, Limit, Limiter, MemoryStore, OnUnavailable, ConfigScope};
//!
//! #[tokio::main]
//! async fn main() -> weir::Result<()> {
//!     let limiter = Limiter::builder(MemoryStore::new())
//!         .with_speculation()
//!         .build();
//!
//!     limiter.create_entity(Entity::new("acct-1")).await?;
//!     limiter
//!         .set_config(
//!             ConfigScope::Resource("gpt-4".into()),
//!             vec![
//!                 Limit::per_period("rpm", 100, 60_000)?,
//!                 Limit::per_period("tpm", 100_000, 60_000)?,
//!             ],
//!             OnUnavailable::FailClosed,
//!         )
//!         .await?;
//!
//!     // Consume one request and an estimated 500 tokens up front.
//!     let lease = limiter
//!         .acquire(Acquire::new("acct-1", "gpt-4").consume("rpm", 1).consume("tpm", 500))
//!         .await?;
//!
//!     // ... call the model, learn the real token count ...
//!     lease.adjust("tpm", 1_500);
//!     lease.release().await
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

mod bucket;
mod repository;

pub mod aggregator;
pub mod audit;
pub mod config;
pub mod entity;
pub mod error;
pub mod kernel;
pub mod keys;
pub mod lease;
pub mod limiter;
pub mod limits;
pub mod namespace;
pub mod store;

pub use crate::aggregator::{Aggregator, AggregatorStats, SnapshotWindow, UsageWindow};
pub use crate::audit::{AuditAction, AuditEvent};
pub use crate::config::{ConfigLevel, ConfigScope, OnUnavailable, ResolvedConfig};
pub use crate::entity::Entity;
pub use crate::error::{Error, ExceededLimit, Result};
pub use crate::kernel::{SystemTimeSource, TimeSource};
pub use crate::lease::{Lease, LeaseState};
pub use crate::limiter::{Acquire, Limiter, LimiterBuilder};
pub use crate::limits::{Limit, LimitName};
pub use crate::namespace::NamespaceRegistry;
pub use crate::repository::RetryPolicy;
pub use crate::store::{Capabilities, Store};

#[cfg(feature = "memory-store")]
pub use crate::store::MemoryStore;
