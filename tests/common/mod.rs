//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use weir::{ConfigScope, Entity, Limit, Limiter, MemoryStore, OnUnavailable, TimeSource};

/// Manually driven clock shared by the store, the limiter, and the test.
pub struct ManualClock {
    current_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn at(initial_ms: i64) -> Arc<Self> {
        Arc::new(Self { current_ms: Mutex::new(initial_ms) })
    }

    pub fn advance(&self, ms: i64) {
        let mut time = self.current_ms.lock().unwrap();
        *time += ms;
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.current_ms.lock().unwrap()
    }
}

/// A limiter over a fresh in-memory store, plus handles on the store and
/// clock for inspection and time travel.
pub fn limiter(speculate: bool) -> (Limiter<MemoryStore>, MemoryStore, Arc<ManualClock>) {
    let clock = ManualClock::at(1_000_000);
    let store = MemoryStore::with_time_source(clock.clone());
    let mut builder = Limiter::builder(store.clone()).time_source(clock.clone());
    if speculate {
        builder = builder.with_speculation();
    }
    (builder.build(), store, clock)
}

/// An rpm limit in spec shape: 100 tokens capacity, 100 per minute.
pub fn rpm_limit() -> Limit {
    Limit::new("rpm", 100_000, 100_000, 60_000).unwrap()
}

/// A tpm limit: 10 000 tokens capacity, 10 000 per minute.
pub fn tpm_limit() -> Limit {
    Limit::new("tpm", 10_000_000, 10_000_000, 60_000).unwrap()
}

/// Creates an entity and a resource-level config for it.
pub async fn provision(limiter: &Limiter<MemoryStore>, entity_id: &str, resource: &str) {
    limiter.create_entity(Entity::new(entity_id)).await.unwrap();
    limiter
        .set_config(
            ConfigScope::Resource(resource.into()),
            vec![rpm_limit(), tpm_limit()],
            OnUnavailable::FailClosed,
        )
        .await
        .unwrap();
}
