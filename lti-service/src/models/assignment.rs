//! Assignment model - one annotatable document per resource link.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// An assignment, keyed by `(tool_consumer_instance_guid, resource_link_id)`.
///
/// `document_url` points at the annotated resource and is only rewritten from
/// authoritative launches; Canvas SpeedGrader launches are known to carry the
/// wrong assignment's metadata and never touch persistent fields.
#[derive(Debug, Clone, FromRow)]
pub struct Assignment {
    pub id: i64,
    pub tenant_id: i64,
    pub tool_consumer_instance_guid: String,
    pub resource_link_id: String,
    pub document_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_gradable: bool,
    pub course_id: Option<i64>,
    pub copied_from_id: Option<i64>,
    pub deep_linking_uuid: Option<String>,
    pub extra: Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Assignment {
    /// The Canvas group-set this assignment is configured for, if any.
    pub fn group_set_id(&self) -> Option<String> {
        match self.extra.get("group_set_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment_with_extra(extra: Value) -> Assignment {
        Assignment {
            id: 1,
            tenant_id: 1,
            tool_consumer_instance_guid: "guid".to_string(),
            resource_link_id: "rl".to_string(),
            document_url: None,
            title: None,
            description: None,
            is_gradable: false,
            course_id: None,
            copied_from_id: None,
            deep_linking_uuid: None,
            extra,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn group_set_id_accepts_string_or_number() {
        assert_eq!(
            assignment_with_extra(json!({"group_set_id": "77"})).group_set_id(),
            Some("77".to_string())
        );
        assert_eq!(
            assignment_with_extra(json!({"group_set_id": 77})).group_set_id(),
            Some("77".to_string())
        );
        assert_eq!(assignment_with_extra(json!({})).group_set_id(), None);
    }
}
