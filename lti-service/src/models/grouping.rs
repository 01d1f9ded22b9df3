//! Grouping model - courses and their subdivisions in one table.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Discriminator for the single-table grouping hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupingKind {
    Course,
    CanvasSection,
    CanvasGroup,
    BlackboardGroup,
}

impl GroupingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingKind::Course => "course",
            GroupingKind::CanvasSection => "canvas_section",
            GroupingKind::CanvasGroup => "canvas_group",
            GroupingKind::BlackboardGroup => "blackboard_group",
        }
    }

    /// Tag mixed into the authority-provided id hash. Canvas sections omit it
    /// for compatibility with ids minted before the tag existed.
    pub fn hash_tag(&self) -> Option<&'static str> {
        match self {
            GroupingKind::Course => None,
            GroupingKind::CanvasSection => None,
            GroupingKind::CanvasGroup => Some("canvas_group"),
            GroupingKind::BlackboardGroup => Some("blackboard_group"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "course" => Some(GroupingKind::Course),
            "canvas_section" => Some(GroupingKind::CanvasSection),
            "canvas_group" => Some(GroupingKind::CanvasGroup),
            "blackboard_group" => Some(GroupingKind::BlackboardGroup),
            _ => None,
        }
    }
}

/// A course, section or group. Non-course rows always have a parent course;
/// course rows never do (enforced by a table check constraint as well).
#[derive(Debug, Clone, FromRow)]
pub struct Grouping {
    pub id: i64,
    pub tenant_id: i64,
    pub authority_provided_id: String,
    pub lms_id: String,
    pub lms_name: String,
    pub kind: String,
    pub parent_id: Option<i64>,
    pub copied_from_id: Option<i64>,
    pub memberships_url: Option<String>,
    pub extra: Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Grouping {
    pub fn kind(&self) -> Option<GroupingKind> {
        GroupingKind::parse(&self.kind)
    }

    pub fn is_course(&self) -> bool {
        self.kind == GroupingKind::Course.as_str()
    }
}

/// Input to a bulk grouping upsert: what the launch or API told us about one
/// course/section/group, before it has a database identity.
#[derive(Debug, Clone)]
pub struct GroupingUpsert {
    pub lms_id: String,
    pub lms_name: String,
    pub extra: Value,
}

impl GroupingUpsert {
    pub fn new(lms_id: impl Into<String>, lms_name: impl Into<String>) -> Self {
        Self {
            lms_id: lms_id.into(),
            lms_name: lms_name.into(),
            extra: Value::Object(Default::default()),
        }
    }
}
