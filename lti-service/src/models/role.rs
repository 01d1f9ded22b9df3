//! LTI role catalogue - raw role strings and their parsed meaning.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Where a role applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleScope {
    Course,
    Institution,
    System,
}

impl RoleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleScope::Course => "course",
            RoleScope::Institution => "institution",
            RoleScope::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "course" => Some(RoleScope::Course),
            "institution" => Some(RoleScope::Institution),
            "system" => Some(RoleScope::System),
            _ => None,
        }
    }
}

/// The effective privilege level of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Admin,
    Instructor,
    Learner,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Admin => "admin",
            RoleKind::Instructor => "instructor",
            RoleKind::Learner => "learner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(RoleKind::Admin),
            "instructor" => Some(RoleKind::Instructor),
            "learner" => Some(RoleKind::Learner),
            _ => None,
        }
    }
}

/// One catalogued role string. `(scope, kind)` here is the canonical parse;
/// tenant overrides are layered on at fetch time and never written back.
#[derive(Debug, Clone, FromRow)]
pub struct LtiRole {
    pub id: i64,
    pub value: String,
    pub scope: String,
    pub kind: String,
    pub created: DateTime<Utc>,
}

impl LtiRole {
    pub fn scope(&self) -> RoleScope {
        RoleScope::parse(&self.scope).unwrap_or(RoleScope::Course)
    }

    pub fn kind(&self) -> RoleKind {
        RoleKind::parse(&self.kind).unwrap_or(RoleKind::Learner)
    }

    pub fn is_instructor(&self) -> bool {
        matches!(self.kind(), RoleKind::Instructor | RoleKind::Admin)
    }

    pub fn is_learner(&self) -> bool {
        self.kind() == RoleKind::Learner
    }
}
