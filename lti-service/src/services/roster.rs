//! Roster reconciliation against NRPS.
//!
//! A fetch replaces a course's (or assignment's) roster in one transaction:
//! every existing row is flipped inactive, then one row per `(member, role)`
//! is upserted with the fetched status. Rows are never deleted, so past
//! membership stays queryable.

use serde_json::json;
use tracing::{info, warn};

use crate::models::{Assignment, Grouping, Tenant};
use crate::services::advantage::{AdvantageService, Member};
use crate::services::database::{Database, PreparedRosterRow};
use crate::services::error::ServiceError;
use crate::services::identity::{display_name, h_userid};
use crate::services::roles::RoleService;

const DEFAULT_NAME_LIMIT: usize = 30;

/// Canvas rejects NRPS resource-link filters that reference the tool through
/// a different installation with this phrase.
const CANVAS_UNEXPECTED_TOOL: &str = "bound to unexpected external tool";

#[derive(Clone)]
pub struct RosterService {
    db: Database,
    advantage: AdvantageService,
    roles: RoleService,
    authority: String,
}

impl RosterService {
    pub fn new(
        db: Database,
        advantage: AdvantageService,
        roles: RoleService,
        authority: String,
    ) -> Self {
        Self {
            db,
            advantage,
            roles,
            authority,
        }
    }

    /// Fetch and reconcile the course-level roster.
    pub async fn fetch_course_roster(
        &self,
        tenant: &Tenant,
        course: &Grouping,
    ) -> Result<usize, ServiceError> {
        let memberships_url = course
            .memberships_url
            .as_deref()
            .ok_or(ServiceError::NoRosterEndpoint)?;

        let container = self
            .advantage
            .fetch_memberships(tenant, memberships_url, None)
            .await
            .map_err(|e| match e {
                ServiceError::ExternalApi { status, body } => {
                    ServiceError::RosterFetchFailed(format!("NRPS returned {status}: {body}"))
                }
                other => other,
            })?;

        let rows = self.reconcile_members(tenant, &container.members).await?;
        self.db.replace_course_roster(course.id, &rows).await?;
        info!(
            course_id = course.id,
            members = container.members.len(),
            "reconciled course roster"
        );
        Ok(container.members.len())
    }

    /// Fetch and reconcile an assignment-scoped roster.
    ///
    /// `lti11_resource_link_id` is the pre-migration resource link id, when
    /// known; Canvas sometimes binds the NRPS filter to it rather than the
    /// 1.3 id, so a rejected fetch is retried once with the legacy id.
    pub async fn fetch_assignment_roster(
        &self,
        tenant: &Tenant,
        course: &Grouping,
        assignment: &Assignment,
        lti11_resource_link_id: Option<&str>,
    ) -> Result<usize, ServiceError> {
        let memberships_url = course
            .memberships_url
            .as_deref()
            .ok_or(ServiceError::NoRosterEndpoint)?;

        let first = self
            .advantage
            .fetch_memberships(tenant, memberships_url, Some(&assignment.resource_link_id))
            .await;

        let container = match first {
            Ok(container) => container,
            Err(ServiceError::ExternalApi { status, body })
                if body.contains(CANVAS_UNEXPECTED_TOOL)
                    && lti11_resource_link_id
                        .is_some_and(|legacy| legacy != assignment.resource_link_id) =>
            {
                warn!(
                    assignment_id = assignment.id,
                    status, "resource link rejected, retrying with legacy id"
                );
                self.advantage
                    .fetch_memberships(tenant, memberships_url, lti11_resource_link_id)
                    .await
                    .map_err(|e| {
                        ServiceError::RosterFetchFailed(format!("NRPS retry failed: {e}"))
                    })?
            }
            Err(ServiceError::ExternalApi { status, body }) => {
                return Err(ServiceError::RosterFetchFailed(format!(
                    "NRPS returned {status}: {body}"
                )));
            }
            Err(other) => return Err(other),
        };

        let rows = self.reconcile_members(tenant, &container.members).await?;
        self.db
            .replace_assignment_roster(assignment.id, &rows)
            .await?;
        info!(
            assignment_id = assignment.id,
            members = container.members.len(),
            "reconciled assignment roster"
        );
        Ok(container.members.len())
    }

    /// Upsert users and roles for the fetched members and produce the roster
    /// rows to commit, one per `(member, role)`.
    async fn reconcile_members(
        &self,
        tenant: &Tenant,
        members: &[Member],
    ) -> Result<Vec<PreparedRosterRow>, ServiceError> {
        let guid = tenant
            .tool_consumer_instance_guid
            .as_deref()
            .ok_or(ServiceError::NoRosterEndpoint)?;
        let collect_student_emails =
            tenant.setting_bool("hypothesis", "collect_student_emails", false);
        let name_limit = tenant
            .setting_str("hypothesis", "display_name_limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NAME_LIMIT);

        let mut rows = Vec::new();
        for member in members {
            let role_values: Vec<&str> = member.roles.iter().map(String::as_str).collect();
            let roles = self.roles.get_roles(tenant, &role_values).await?;

            let is_instructor = roles.iter().any(|r| r.is_instructor());
            // Learner emails are withheld unless the tenant opted in.
            let email = member
                .email
                .as_deref()
                .filter(|_| is_instructor || collect_student_emails);

            let stable_id = member.stable_user_id();
            let hashed = h_userid(&self.authority, guid, stable_id);
            let name = display_name(
                member.name.as_deref(),
                member.given_name.as_deref(),
                member.family_name.as_deref(),
                member.email.as_deref(),
                name_limit,
            );
            let user = self
                .db
                .upsert_user(
                    tenant.id,
                    stable_id,
                    &hashed,
                    Some(&name),
                    email,
                    &json!(member.roles),
                )
                .await?;

            let active = member.is_active();
            for role in &roles {
                rows.push(PreparedRosterRow {
                    user_id: user.id,
                    lti_role_id: role.id,
                    active,
                });
            }
        }
        Ok(rows)
    }
}
