//! Membership recorder.
//!
//! Records who launched what with which roles. Roles live on the edge
//! because a user's effective role differs per context. All writes are
//! idempotent bulk upserts that bump `updated` on conflict.

use crate::models::{Assignment, Grouping, LmsUser, LtiRole};
use crate::services::database::Database;
use crate::services::error::ServiceError;

#[derive(Clone)]
pub struct MembershipService {
    db: Database,
}

impl MembershipService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One edge per role. Empty roles is a no-op.
    pub async fn upsert_assignment_membership(
        &self,
        assignment: &Assignment,
        user: &LmsUser,
        roles: &[LtiRole],
    ) -> Result<(), ServiceError> {
        let role_ids: Vec<i64> = roles.iter().map(|r| r.id).collect();
        self.db
            .upsert_assignment_memberships(assignment.id, user.id, &role_ids)
            .await
    }

    pub async fn upsert_course_membership(
        &self,
        course: &Grouping,
        user: &LmsUser,
        roles: &[LtiRole],
    ) -> Result<(), ServiceError> {
        let role_ids: Vec<i64> = roles.iter().map(|r| r.id).collect();
        self.db
            .upsert_course_memberships(course.id, user.id, &role_ids)
            .await
    }
}
