use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tackroom_auth::Principal;

/// What a mutating request did.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditVerb {
    Created,
    Updated,
    Deleted,
}

impl AuditVerb {
    /// `POST`, `PUT`/`PATCH` and `DELETE` are audited; everything else is not.
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Some(AuditVerb::Created),
            "PUT" | "PATCH" => Some(AuditVerb::Updated),
            "DELETE" => Some(AuditVerb::Deleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditVerb::Created => "Created",
            AuditVerb::Updated => "Updated",
            AuditVerb::Deleted => "Deleted",
        }
    }
}

impl core::fmt::Display for AuditVerb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity a request path refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Option<String>,
}

/// Order status before and after a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: Option<String>,
    pub to: String,
}

/// Entity types that carry a status transition.
const STATUS_TRACKED: &[&str] = &["Order"];

/// Infer the entity from a request path.
///
/// `/orders/42` → `Order` / `42`; `/api/v1/orders_saddles/7/status` →
/// `OrderSaddle` / `7`. Leading `api` and version segments are skipped.
pub fn infer_entity(path: &str) -> Option<EntityRef> {
    let mut segments = path
        .split('?')
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .skip_while(|s| *s == "api" || is_version(s));

    let collection = segments.next()?;
    let entity_type = collection
        .split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| capitalize(&singularize(w)))
        .collect::<String>();
    if entity_type.is_empty() {
        return None;
    }

    Some(EntityRef {
        entity_type,
        entity_id: segments.next().map(str::to_string),
    })
}

fn is_version(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if let Some(stem) = lower.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if lower.ends_with("ss") {
        return lower;
    }
    match lower.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => lower,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One structured action record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub actor_id: String,
    /// Role code of the actor.
    pub actor_type: i16,
    pub verb: AuditVerb,
    /// `"Updated Order 42"`; entity and id are left out when unknown.
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    /// The transition is only kept for status-tracked entities.
    pub fn new(
        actor: &Principal,
        verb: AuditVerb,
        entity: Option<EntityRef>,
        transition: Option<StatusTransition>,
    ) -> Self {
        let (entity_type, entity_id) = match entity {
            Some(e) => (Some(e.entity_type), e.entity_id),
            None => (None, None),
        };

        let action = describe(verb, entity_type.as_deref(), entity_id.as_deref());

        let tracked = entity_type
            .as_deref()
            .is_some_and(|t| STATUS_TRACKED.contains(&t));
        let (status_from, status_to) = match transition {
            Some(t) if tracked => (t.from, Some(t.to)),
            _ => (None, None),
        };

        Self {
            entry_id: Uuid::now_v7(),
            actor_id: actor.id.to_string(),
            actor_type: actor.role.code(),
            verb,
            action,
            entity_type,
            entity_id,
            status_from,
            status_to,
            occurred_at: Utc::now(),
        }
    }
}

fn describe(verb: AuditVerb, entity_type: Option<&str>, entity_id: Option<&str>) -> String {
    match (entity_type, entity_id) {
        (Some(t), Some(id)) => format!("{verb} {t} {id}"),
        (Some(t), None) => format!("{verb} {t}"),
        (None, _) => verb.to_string(),
    }
}
