//! Append-only audit events for administrative mutations.
//!
//! Every entity and config mutation appends one event under the owning
//! entity's audit partition. Events expire through the store's TTL;
//! archival of expired events is an external concern.

use std::collections::HashMap;

use uuid::Uuid;

use crate::keys::ATTR_TTL;
use crate::store::{AttrValue, Item, get_n, get_s};

/// How long audit events are retained before TTL expiry.
const AUDIT_RETENTION_MS: i64 = 90 * 86_400_000;

const ATTR_ACTION: &str = "action";
const ATTR_SUBJECT: &str = "subject";
const ATTR_DETAIL: &str = "detail";
const ATTR_AT: &str = "at_ms";

/// An administrative mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// An entity was created.
    EntityCreated,
    /// An entity's metadata was replaced.
    EntityUpdated,
    /// An entity and everything it owned was deleted.
    EntityDeleted,
    /// A limit config record was written.
    ConfigSet,
    /// A limit config record was deleted.
    ConfigDeleted,
}

impl AuditAction {
    fn as_str(self) -> &'static str {
        match self {
            AuditAction::EntityCreated => "entity_created",
            AuditAction::EntityUpdated => "entity_updated",
            AuditAction::EntityDeleted => "entity_deleted",
            AuditAction::ConfigSet => "config_set",
            AuditAction::ConfigDeleted => "config_deleted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "entity_created" => Some(AuditAction::EntityCreated),
            "entity_updated" => Some(AuditAction::EntityUpdated),
            "entity_deleted" => Some(AuditAction::EntityDeleted),
            "config_set" => Some(AuditAction::ConfigSet),
            "config_deleted" => Some(AuditAction::ConfigDeleted),
            _ => None,
        }
    }
}

/// One recorded administrative mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Unique event id.
    pub event_id: String,

    /// What happened.
    pub action: AuditAction,

    /// The entity (or `_system_`) the mutation applied to.
    pub subject: String,

    /// Free-form context, e.g. the config version written.
    pub detail: HashMap<String, String>,

    /// When it happened, epoch milliseconds.
    pub at_ms: i64,
}

impl AuditEvent {
    pub(crate) fn new(
        action: AuditAction,
        subject: &str,
        detail: HashMap<String, String>,
        at_ms: i64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            action,
            subject: subject.to_owned(),
            detail,
            at_ms,
        }
    }

    pub(crate) fn encode(&self) -> Item {
        let mut item = Item::new();
        item.insert(ATTR_ACTION.into(), AttrValue::S(self.action.as_str().to_owned()));
        item.insert(ATTR_SUBJECT.into(), AttrValue::S(self.subject.clone()));
        if !self.detail.is_empty() {
            item.insert(ATTR_DETAIL.into(), AttrValue::M(self.detail.clone()));
        }
        item.insert(ATTR_AT.into(), AttrValue::N(self.at_ms));
        item.insert(ATTR_TTL.into(), AttrValue::N(self.at_ms + AUDIT_RETENTION_MS));
        item
    }

    pub(crate) fn decode(item: &Item) -> Option<Self> {
        Some(Self {
            // The id lives in the sort key; carry what the record holds.
            event_id: String::new(),
            action: AuditAction::parse(get_s(item, ATTR_ACTION)?)?,
            subject: get_s(item, ATTR_SUBJECT)?.to_owned(),
            detail: item
                .get(ATTR_DETAIL)
                .and_then(AttrValue::as_map)
                .cloned()
                .unwrap_or_default(),
            at_ms: get_n(item, ATTR_AT)?,
        })
    }
}
