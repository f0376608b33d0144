mod common;

use std::collections::HashMap;

use common::{ManualClock, limiter, rpm_limit};
use weir::store::Store;
use weir::{
    Acquire, AuditAction, ConfigScope, Entity, Error, Limiter, MemoryStore, NamespaceRegistry,
    OnUnavailable, keys,
};

#[tokio::test]
async fn it_registers_and_resolves_namespaces() {
    let store = MemoryStore::new();
    let registry = NamespaceRegistry::new(store.clone());

    let ns_id = registry.register("team-ml").await.unwrap();
    assert_eq!(ns_id.len(), 11);

    assert_eq!(registry.lookup("team-ml").await.unwrap(), Some(ns_id.clone()));
    assert_eq!(registry.name_of(&ns_id).await.unwrap(), Some("team-ml".to_owned()));
    assert_eq!(registry.lookup("unknown").await.unwrap(), None);

    let err = registry.register("team-ml").await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn it_rejects_invalid_namespace_names() {
    let registry = NamespaceRegistry::new(MemoryStore::new());
    assert!(registry.register("").await.is_err());
    assert!(registry.register("has/slash").await.is_err());
    assert!(registry.register("has#hash").await.is_err());
    assert!(registry.register("_").await.is_err());
}

#[tokio::test]
async fn it_soft_deletes_then_purges() {
    let clock = ManualClock::at(1_000_000);
    let store = MemoryStore::with_time_source(clock.clone());
    let registry = NamespaceRegistry::new(store.clone());
    let ns_id = registry.register("tenant-a").await.unwrap();

    // Put real data under the namespace.
    let limiter = Limiter::builder(store.clone())
        .namespace(ns_id.clone())
        .time_source(clock)
        .build();
    limiter.create_entity(Entity::new("acct")).await.unwrap();
    limiter
        .set_config(
            ConfigScope::Resource("gpt".into()),
            vec![rpm_limit()],
            OnUnavailable::FailClosed,
        )
        .await
        .unwrap();
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();

    // Purge before soft delete is refused.
    assert!(registry.purge("tenant-a").await.is_err());

    registry.soft_delete("tenant-a").await.unwrap();
    assert_eq!(registry.lookup("tenant-a").await.unwrap(), None);

    let purged = registry.purge("tenant-a").await.unwrap();
    assert!(purged > 0);
    assert!(store
        .scan_pk_prefix(&format!("{ns_id}/"))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(registry.name_of(&ns_id).await.unwrap(), None);
}

#[tokio::test]
async fn it_enforces_entity_creation_rules() {
    let (limiter, _store, _clock) = limiter(false);

    // Cascade needs a parent.
    let err = limiter
        .create_entity(Entity {
            id: "x".into(),
            parent_id: None,
            cascade: true,
            metadata: HashMap::new(),
            created_ms: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    // The parent must exist first.
    let err = limiter
        .create_entity(Entity::new("child").with_parent("ghost", true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParentNotFound(_)));

    // Duplicates are rejected.
    limiter.create_entity(Entity::new("acct")).await.unwrap();
    let err = limiter.create_entity(Entity::new("acct")).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn it_updates_metadata_but_not_the_hierarchy() {
    let (limiter, _store, _clock) = limiter(false);
    limiter.create_entity(Entity::new("proj")).await.unwrap();
    limiter
        .create_entity(
            Entity::new("acct")
                .with_parent("proj", true)
                .with_metadata("team", "ml"),
        )
        .await
        .unwrap();

    let updated = limiter
        .update_entity("acct", HashMap::from([("team".to_owned(), "infra".to_owned())]))
        .await
        .unwrap();

    // Metadata replaced; cascade and parent untouched.
    assert_eq!(updated.metadata.get("team").map(String::as_str), Some("infra"));
    assert_eq!(updated.parent_id.as_deref(), Some("proj"));
    assert!(updated.cascade);

    let err = limiter.update_entity("ghost", HashMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(_)));
}

#[tokio::test]
async fn it_deletes_an_entity_and_everything_it_owns() {
    let (limiter, store, _clock) = limiter(false);
    limiter.create_entity(Entity::new("acct")).await.unwrap();
    limiter
        .set_config(
            ConfigScope::EntityResource { entity_id: "acct".into(), resource: "gpt".into() },
            vec![rpm_limit()],
            OnUnavailable::FailClosed,
        )
        .await
        .unwrap();
    limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1))
        .await
        .unwrap()
        .release()
        .await
        .unwrap();

    limiter.delete_entity("acct").await.unwrap();

    assert!(limiter.get_entity("acct").await.unwrap().is_none());
    assert!(store
        .get_item(&keys::bucket("default", "acct", "gpt", 0))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_item(&keys::entity_config("default", "acct", "gpt"))
        .await
        .unwrap()
        .is_none());

    // Acquires against the deleted entity now fail on metadata, even
    // though a config record at a wider scope could still exist.
    let err = limiter
        .acquire(Acquire::new("acct", "gpt").consume("rpm", 1).with_limits(vec![rpm_limit()]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(_)));
}

#[tokio::test]
async fn it_keeps_an_audit_trail() {
    let (limiter, _store, clock) = limiter(false);
    limiter.create_entity(Entity::new("acct")).await.unwrap();
    clock.advance(10);
    limiter
        .set_config(
            ConfigScope::EntityResource { entity_id: "acct".into(), resource: "gpt".into() },
            vec![rpm_limit()],
            OnUnavailable::FailClosed,
        )
        .await
        .unwrap();
    clock.advance(10);
    limiter
        .update_entity("acct", HashMap::from([("tier".to_owned(), "pro".to_owned())]))
        .await
        .unwrap();

    let trail = limiter.audit_trail("acct").await.unwrap();
    let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::EntityCreated, AuditAction::ConfigSet, AuditAction::EntityUpdated]
    );
    assert!(trail.iter().all(|e| !e.event_id.is_empty()));
    assert!(trail.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));

    // Deletion purges the trail and leaves a single tombstone event.
    clock.advance(10);
    limiter.delete_entity("acct").await.unwrap();
    let trail = limiter.audit_trail("acct").await.unwrap();
    let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::EntityDeleted]);
}
