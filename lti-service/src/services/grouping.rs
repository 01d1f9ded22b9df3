//! Grouping upserts: courses and their sections/groups.
//!
//! All grouping rows share one table discriminated by kind; this service owns
//! the authority-id derivation and the bulk upsert for each kind, plus the
//! copied-course linkage read from launch history claims.

use serde_json::json;
use tracing::info;

use crate::models::{Grouping, GroupingKind, GroupingUpsert, Tenant};
use crate::services::database::{Database, PreparedGrouping};
use crate::services::error::ServiceError;
use crate::services::identity::{course_authority_id, grouping_authority_id};
use crate::services::payload::LaunchPayload;

#[derive(Clone)]
pub struct GroupingService {
    db: Database,
}

impl GroupingService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the course a launch belongs to, linking `copied_from` on first
    /// sight when the launch carries a course-copy history claim.
    pub async fn upsert_course_from_launch(
        &self,
        tenant: &Tenant,
        guid: &str,
        payload: &LaunchPayload,
    ) -> Result<Grouping, ServiceError> {
        let context_id = payload.require("context_id")?;
        let lms_name = payload.context_title().unwrap_or(context_id);
        let authority_id = course_authority_id(guid, context_id);

        let existing = self
            .db
            .find_grouping_by_authority_id(tenant.id, authority_id.as_str())
            .await?;
        let is_new = existing.is_none();

        let entry = PreparedGrouping {
            authority_provided_id: authority_id,
            lms_id: context_id.to_string(),
            lms_name: lms_name.to_string(),
            extra: json!({}),
        };
        let mut course = self
            .db
            .upsert_groupings(tenant.id, &[entry], GroupingKind::Course, None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("course upsert returned no row")))?;

        // Copy linkage only for a course we have never seen; re-launches of a
        // known course keep whatever lineage was recorded at creation.
        if is_new {
            if let Some(original) = self
                .find_copied_from_course(tenant, &payload.context_id_history())
                .await?
            {
                info!(
                    course_id = course.id,
                    copied_from = original.id,
                    "linking copied course"
                );
                self.db.set_grouping_copied_from(course.id, original.id).await?;
                course.copied_from_id = Some(original.id);
            }
        }

        // The NRPS endpoint from the launch keeps the course refreshable by
        // the background roster loop.
        if let Some(url) = payload.context_memberships_url() {
            if course.memberships_url.as_deref() != Some(url) {
                self.db.set_grouping_memberships_url(course.id, url).await?;
                course.memberships_url = Some(url.to_string());
            }
        }

        Ok(course)
    }

    /// The oldest course this tenant knows among the history ids.
    /// History lists arrive newest first; lineage points at the origin.
    async fn find_copied_from_course(
        &self,
        tenant: &Tenant,
        history_ids: &[&str],
    ) -> Result<Option<Grouping>, ServiceError> {
        if history_ids.is_empty() {
            return Ok(None);
        }
        let matches = self.db.find_courses_by_lms_ids(tenant.id, history_ids).await?;
        Ok(matches.into_iter().next())
    }

    /// Bulk upsert sections or groups under `parent`. Returns rows in input
    /// order.
    pub async fn upsert_groupings(
        &self,
        tenant: &Tenant,
        guid: &str,
        parent: &Grouping,
        kind: GroupingKind,
        entries: &[GroupingUpsert],
    ) -> Result<Vec<Grouping>, ServiceError> {
        debug_assert!(kind != GroupingKind::Course, "sub-groupings only");

        let prepared: Vec<PreparedGrouping> = entries
            .iter()
            .map(|e| PreparedGrouping {
                authority_provided_id: grouping_authority_id(
                    guid,
                    &parent.lms_id,
                    kind.hash_tag(),
                    &e.lms_id,
                ),
                lms_id: e.lms_id.clone(),
                lms_name: e.lms_name.clone(),
                extra: e.extra.clone(),
            })
            .collect();

        self.db
            .upsert_groupings(tenant.id, &prepared, kind, Some(parent.id))
            .await
    }

    /// Record that `user_id` belongs to each of `groupings`.
    pub async fn upsert_memberships(
        &self,
        user_id: i64,
        groupings: &[Grouping],
    ) -> Result<(), ServiceError> {
        let ids: Vec<i64> = groupings.iter().map(|g| g.id).collect();
        self.db.upsert_grouping_memberships(user_id, &ids).await
    }

    /// Groupings of `kind` under `course` that the user belongs to, optionally
    /// narrowed to one Canvas group set. Used when a grader acts on behalf of
    /// a student's group.
    pub async fn get_course_groupings_for_user(
        &self,
        course: &Grouping,
        user_id: i64,
        kind: GroupingKind,
        group_set_id: Option<&str>,
    ) -> Result<Vec<Grouping>, ServiceError> {
        self.db
            .get_course_groupings_for_user(course.id, user_id, kind, group_set_id)
            .await
    }
}
