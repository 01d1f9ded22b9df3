//! Launch pipeline.
//!
//! Everything between a verified launch and a renderable state: apply product
//! quirks, upsert the user, course, assignment and membership edges. Each
//! step is owned by its service; this module only sequences them.

use serde_json::json;
use tracing::info;

use crate::models::{Assignment, Grouping, LmsUser, LtiRole, Tenant};
use crate::services::assignment::AssignmentService;
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::grouping::GroupingService;
use crate::services::identity::{display_name, h_userid};
use crate::services::membership::MembershipService;
use crate::services::payload::LaunchPayload;
use crate::services::plugin::PluginRegistry;
use crate::services::roles::RoleService;
use crate::services::verification::VerificationService;

const DEFAULT_NAME_LIMIT: usize = 30;

/// Everything downstream consumers need from a processed launch.
#[derive(Debug)]
pub struct LaunchOutcome {
    pub tenant: Tenant,
    pub payload: LaunchPayload,
    pub user: LmsUser,
    pub roles: Vec<LtiRole>,
    pub course: Option<Grouping>,
    /// `None` when the launch resolved no document URL; such launches go to
    /// the content chooser instead.
    pub assignment: Option<Assignment>,
}

#[derive(Clone)]
pub struct LaunchService {
    db: Database,
    verification: VerificationService,
    roles: RoleService,
    groupings: GroupingService,
    assignments: AssignmentService,
    memberships: MembershipService,
    plugins: std::sync::Arc<PluginRegistry>,
    authority: String,
}

impl LaunchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        verification: VerificationService,
        roles: RoleService,
        groupings: GroupingService,
        assignments: AssignmentService,
        memberships: MembershipService,
        plugins: std::sync::Arc<PluginRegistry>,
        authority: String,
    ) -> Self {
        Self {
            db,
            verification,
            roles,
            groupings,
            assignments,
            memberships,
            plugins,
            authority,
        }
    }

    /// Process an LTI 1.1 form post.
    pub async fn handle_lti11(
        &self,
        launch_url: &str,
        params: &[(String, String)],
        query_resource_link_id: Option<&str>,
    ) -> Result<LaunchOutcome, ServiceError> {
        let (tenant, payload) = self.verification.verify_lti11(launch_url, params).await?;
        self.process(tenant, payload, query_resource_link_id).await
    }

    /// Process a verified LTI 1.3 id_token.
    pub async fn handle_lti13(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
        query_resource_link_id: Option<&str>,
    ) -> Result<LaunchOutcome, ServiceError> {
        let (tenant, payload) = self
            .verification
            .verify_lti13(id_token, expected_nonce)
            .await?;
        self.process(tenant, payload, query_resource_link_id).await
    }

    async fn process(
        &self,
        tenant: Tenant,
        mut payload: LaunchPayload,
        query_resource_link_id: Option<&str>,
    ) -> Result<LaunchOutcome, ServiceError> {
        let plugin = self.plugins.for_payload(&payload);
        plugin.apply_quirks(&mut payload, query_resource_link_id);

        let guid = payload
            .tool_consumer_instance_guid()
            .or(tenant.tool_consumer_instance_guid.as_deref())
            .ok_or_else(|| {
                ServiceError::MissingRequiredClaim("tool_consumer_instance_guid".to_string())
            })?
            .to_string();

        let role_values = payload.roles();
        let roles = self.roles.get_roles(&tenant, &role_values).await?;
        let user = self.upsert_launch_user(&tenant, &guid, &payload, &roles).await?;

        let course = match payload.context_id() {
            Some(_) => Some(
                self.groupings
                    .upsert_course_from_launch(&tenant, &guid, &payload)
                    .await?,
            ),
            None => None,
        };

        let assignment = match self
            .assignments
            .get_for_launch(&tenant, &guid, &payload, plugin, course.as_ref())
            .await
        {
            Ok(assignment) => Some(assignment),
            // No document yet: the launch continues into content selection.
            Err(ServiceError::NoDocumentUrl) => None,
            Err(other) => return Err(other),
        };

        if let Some(course) = &course {
            self.memberships
                .upsert_course_membership(course, &user, &roles)
                .await?;
        }
        if let Some(assignment) = &assignment {
            self.memberships
                .upsert_assignment_membership(assignment, &user, &roles)
                .await?;
        }

        info!(
            tenant_id = tenant.id,
            user_id = user.id,
            course_id = course.as_ref().map(|c| c.id),
            assignment_id = assignment.as_ref().map(|a| a.id),
            "processed launch"
        );
        Ok(LaunchOutcome {
            tenant,
            payload,
            user,
            roles,
            course,
            assignment,
        })
    }

    async fn upsert_launch_user(
        &self,
        tenant: &Tenant,
        guid: &str,
        payload: &LaunchPayload,
        roles: &[LtiRole],
    ) -> Result<LmsUser, ServiceError> {
        let lti_user_id = payload.require("user_id")?;
        let hashed = h_userid(&self.authority, guid, lti_user_id);

        let is_instructor = roles.iter().any(|r| r.is_instructor());
        let collect_student_emails =
            tenant.setting_bool("hypothesis", "collect_student_emails", false);
        let email = payload
            .get("lis_person_contact_email_primary")
            .filter(|_| is_instructor || collect_student_emails);

        let name_limit = tenant
            .setting_str("hypothesis", "display_name_limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_NAME_LIMIT);
        let name = display_name(
            payload.get("lis_person_name_full"),
            payload.get("lis_person_name_given"),
            payload.get("lis_person_name_family"),
            payload.get("lis_person_contact_email_primary"),
            name_limit,
        );

        let raw_roles: Vec<&str> = payload.roles();
        self.db
            .upsert_user(
                tenant.id,
                lti_user_id,
                &hashed,
                Some(&name),
                email,
                &json!(raw_roles),
            )
            .await
    }
}
