//! Membership edge models.
//!
//! A user's effective role is per-context, so the role sits on the edge.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// (user x assignment x role), unique on the triple.
#[derive(Debug, Clone, FromRow)]
pub struct AssignmentMembership {
    pub id: i64,
    pub assignment_id: i64,
    pub user_id: i64,
    pub lti_role_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// (user x course x role), unique on the triple.
#[derive(Debug, Clone, FromRow)]
pub struct CourseMembership {
    pub id: i64,
    pub course_id: i64,
    pub user_id: i64,
    pub lti_role_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// (user x grouping) for sections and groups; no role on this edge.
#[derive(Debug, Clone, FromRow)]
pub struct GroupingMembership {
    pub id: i64,
    pub grouping_id: i64,
    pub user_id: i64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// One roster row from NRPS reconciliation. Rows are never deleted; members
/// missing from the latest fetch are kept with `active = false`.
#[derive(Debug, Clone, FromRow)]
pub struct RosterRow {
    pub id: i64,
    pub user_id: i64,
    pub lti_role_id: i64,
    pub active: bool,
    pub updated: DateTime<Utc>,
}
