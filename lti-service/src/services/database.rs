//! PostgreSQL data layer.
//!
//! One wrapper over the pool, one method per operation, string queries via
//! `query_as`. Bulk upserts go through `UNNEST` so each entity type costs a
//! single statement per transaction; callers that need multi-statement
//! atomicity (roster reconciliation, token refresh) get it here too.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::models::{
    Assignment, Grouping, GroupingKind, LmsUser, LtiRole, OAuth2Token, RoleKind, RoleScope,
    RosterRow, RsaKey, Tenant,
};
use crate::services::error::ServiceError;

/// Input row for a bulk grouping upsert, already hashed.
#[derive(Debug, Clone)]
pub struct PreparedGrouping {
    pub authority_provided_id: String,
    pub lms_id: String,
    pub lms_name: String,
    pub extra: Value,
}

/// Input row for roster reconciliation.
#[derive(Debug, Clone)]
pub struct PreparedRosterRow {
    pub user_id: i64,
    pub lti_role_id: i64,
    pub active: bool,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Tenant Operations ====================

    pub async fn find_tenant_by_id(&self, tenant_id: i64) -> Result<Option<Tenant>, ServiceError> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    pub async fn find_tenant_by_consumer_key(
        &self,
        consumer_key: &str,
    ) -> Result<Option<Tenant>, ServiceError> {
        let tenant =
            sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE consumer_key = $1")
                .bind(consumer_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(tenant)
    }

    pub async fn find_tenant_by_issuer_client_id(
        &self,
        issuer: &str,
        client_id: &str,
    ) -> Result<Option<Tenant>, ServiceError> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE issuer = $1 AND client_id = $2",
        )
        .bind(issuer)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    /// Record the installation guid learned from a first launch.
    pub async fn learn_tenant_guid(
        &self,
        tenant_id: i64,
        guid: &str,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE tenants SET tool_consumer_instance_guid = $1, updated = now() WHERE id = $2",
        )
        .bind(guid)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump last-seen bookkeeping on every verified launch.
    pub async fn touch_tenant(&self, tenant_id: i64) -> Result<(), ServiceError> {
        sqlx::query("UPDATE tenants SET last_launched_at = now(), updated = now() WHERE id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== User Operations ====================

    /// Upsert a user by `(tenant, h_userid)`.
    ///
    /// Launch-provided fields only overwrite when present, so a roster fetch
    /// without profile data does not blank out a name learned at launch.
    pub async fn upsert_user(
        &self,
        tenant_id: i64,
        lti_user_id: &str,
        h_userid: &str,
        display_name: Option<&str>,
        email: Option<&str>,
        roles_cached: &Value,
    ) -> Result<LmsUser, ServiceError> {
        let user = sqlx::query_as::<_, LmsUser>(
            r#"
            INSERT INTO lms_users (tenant_id, lti_user_id, h_userid, display_name, email, roles_cached)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, h_userid) DO UPDATE SET
                lti_user_id = EXCLUDED.lti_user_id,
                display_name = COALESCE(EXCLUDED.display_name, lms_users.display_name),
                email = COALESCE(EXCLUDED.email, lms_users.email),
                roles_cached = EXCLUDED.roles_cached,
                updated = now()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(lti_user_id)
        .bind(h_userid)
        .bind(display_name)
        .bind(email)
        .bind(roles_cached)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_user_by_h_userid(
        &self,
        tenant_id: i64,
        h_userid: &str,
    ) -> Result<Option<LmsUser>, ServiceError> {
        let user = sqlx::query_as::<_, LmsUser>(
            "SELECT * FROM lms_users WHERE tenant_id = $1 AND h_userid = $2",
        )
        .bind(tenant_id)
        .bind(h_userid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    // ==================== Grouping Operations ====================

    /// One bulk upsert keyed on `(tenant_id, authority_provided_id)`.
    /// Returns rows in the same order as `entries`.
    pub async fn upsert_groupings(
        &self,
        tenant_id: i64,
        entries: &[PreparedGrouping],
        kind: GroupingKind,
        parent_id: Option<i64>,
    ) -> Result<Vec<Grouping>, ServiceError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let authority_ids: Vec<&str> =
            entries.iter().map(|e| e.authority_provided_id.as_str()).collect();
        let lms_ids: Vec<&str> = entries.iter().map(|e| e.lms_id.as_str()).collect();
        let lms_names: Vec<&str> = entries.iter().map(|e| e.lms_name.as_str()).collect();
        let extras: Vec<Value> = entries.iter().map(|e| e.extra.clone()).collect();

        let rows = sqlx::query_as::<_, Grouping>(
            r#"
            INSERT INTO groupings (tenant_id, authority_provided_id, lms_id, lms_name, kind, parent_id, extra)
            SELECT $1, t.authority_provided_id, t.lms_id, t.lms_name, $2, $3, t.extra
            FROM UNNEST($4::text[], $5::text[], $6::text[], $7::jsonb[])
                AS t(authority_provided_id, lms_id, lms_name, extra)
            ON CONFLICT (tenant_id, authority_provided_id) DO UPDATE SET
                lms_name = EXCLUDED.lms_name,
                extra = EXCLUDED.extra,
                updated = now()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(parent_id)
        .bind(&authority_ids)
        .bind(&lms_ids)
        .bind(&lms_names)
        .bind(&extras)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not guarantee input order.
        let by_authority: HashMap<String, Grouping> = rows
            .into_iter()
            .map(|g| (g.authority_provided_id.clone(), g))
            .collect();
        let ordered = entries
            .iter()
            .filter_map(|e| by_authority.get(&e.authority_provided_id).cloned())
            .collect();
        Ok(ordered)
    }

    pub async fn find_grouping_by_authority_id(
        &self,
        tenant_id: i64,
        authority_provided_id: &str,
    ) -> Result<Option<Grouping>, ServiceError> {
        let grouping = sqlx::query_as::<_, Grouping>(
            "SELECT * FROM groupings WHERE tenant_id = $1 AND authority_provided_id = $2",
        )
        .bind(tenant_id)
        .bind(authority_provided_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(grouping)
    }

    /// Courses for this tenant matching any of `lms_ids`, oldest first.
    pub async fn find_courses_by_lms_ids(
        &self,
        tenant_id: i64,
        lms_ids: &[&str],
    ) -> Result<Vec<Grouping>, ServiceError> {
        let courses = sqlx::query_as::<_, Grouping>(
            r#"
            SELECT * FROM groupings
            WHERE tenant_id = $1 AND kind = 'course' AND lms_id = ANY($2)
            ORDER BY created ASC
            "#,
        )
        .bind(tenant_id)
        .bind(lms_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(courses)
    }

    pub async fn set_grouping_copied_from(
        &self,
        grouping_id: i64,
        copied_from_id: i64,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE groupings SET copied_from_id = $1, updated = now() WHERE id = $2")
            .bind(copied_from_id)
            .bind(grouping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_grouping_memberships_url(
        &self,
        grouping_id: i64,
        memberships_url: &str,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE groupings SET memberships_url = $1, updated = now() WHERE id = $2")
            .bind(memberships_url)
            .bind(grouping_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Groupings of `kind` under `course_id` that `user_id` belongs to,
    /// optionally narrowed to one Canvas group set.
    pub async fn get_course_groupings_for_user(
        &self,
        course_id: i64,
        user_id: i64,
        kind: GroupingKind,
        group_set_id: Option<&str>,
    ) -> Result<Vec<Grouping>, ServiceError> {
        let groupings = sqlx::query_as::<_, Grouping>(
            r#"
            SELECT g.* FROM groupings g
            JOIN grouping_memberships gm ON gm.grouping_id = g.id
            WHERE g.parent_id = $1
              AND g.kind = $2
              AND gm.user_id = $3
              AND ($4::text IS NULL OR g.extra->>'group_set_id' = $4)
            ORDER BY g.id
            "#,
        )
        .bind(course_id)
        .bind(kind.as_str())
        .bind(user_id)
        .bind(group_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groupings)
    }

    /// Courses that have a roster endpoint, for the periodic refresh loop.
    pub async fn courses_with_roster_endpoint(&self) -> Result<Vec<Grouping>, ServiceError> {
        let courses = sqlx::query_as::<_, Grouping>(
            "SELECT * FROM groupings WHERE kind = 'course' AND memberships_url IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(courses)
    }

    // ==================== Assignment Operations ====================

    pub async fn find_assignment(
        &self,
        guid: &str,
        resource_link_id: &str,
    ) -> Result<Option<Assignment>, ServiceError> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT * FROM assignments
            WHERE tool_consumer_instance_guid = $1 AND resource_link_id = $2
            "#,
        )
        .bind(guid)
        .bind(resource_link_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(assignment)
    }

    /// The first assignment matching any of the history ids, scanning the
    /// history order the caller passed (newest first).
    pub async fn find_assignment_by_history(
        &self,
        guid: &str,
        history_ids: &[&str],
    ) -> Result<Option<Assignment>, ServiceError> {
        for resource_link_id in history_ids {
            if let Some(assignment) = self.find_assignment(guid, resource_link_id).await? {
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_assignment(
        &self,
        tenant_id: i64,
        guid: &str,
        resource_link_id: &str,
        document_url: Option<&str>,
        copied_from_id: Option<i64>,
        deep_linking_uuid: Option<&str>,
    ) -> Result<Assignment, ServiceError> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            INSERT INTO assignments
                (tenant_id, tool_consumer_instance_guid, resource_link_id, document_url,
                 copied_from_id, deep_linking_uuid)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tool_consumer_instance_guid, resource_link_id) DO UPDATE SET
                updated = now()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(guid)
        .bind(resource_link_id)
        .bind(document_url)
        .bind(copied_from_id)
        .bind(deep_linking_uuid)
        .fetch_one(&self.pool)
        .await?;
        Ok(assignment)
    }

    /// Rewrite the authoritative launch-provided fields. Never called for
    /// SpeedGrader launches.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_assignment_from_launch(
        &self,
        assignment_id: i64,
        document_url: Option<&str>,
        title: Option<&str>,
        description: Option<&str>,
        is_gradable: bool,
        course_id: Option<i64>,
        group_set_id: Option<&str>,
    ) -> Result<Assignment, ServiceError> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            UPDATE assignments SET
                document_url = COALESCE($2, document_url),
                title = COALESCE($3, title),
                description = COALESCE($4, description),
                is_gradable = $5,
                course_id = COALESCE($6, course_id),
                extra = CASE
                    WHEN $7::text IS NULL THEN extra - 'group_set_id'
                    ELSE jsonb_set(extra, '{group_set_id}', to_jsonb($7::text))
                END,
                updated = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(assignment_id)
        .bind(document_url)
        .bind(title)
        .bind(description)
        .bind(is_gradable)
        .bind(course_id)
        .bind(group_set_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(assignment)
    }

    // ==================== Membership Operations ====================

    /// One row per role; bulk, idempotent, `updated` bumped on conflict.
    /// Empty input commits nothing.
    pub async fn upsert_assignment_memberships(
        &self,
        assignment_id: i64,
        user_id: i64,
        role_ids: &[i64],
    ) -> Result<(), ServiceError> {
        // An empty VALUES list would degenerate to INSERT DEFAULT VALUES.
        if role_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO assignment_memberships (assignment_id, user_id, lti_role_id)
            SELECT $1, $2, role_id FROM UNNEST($3::bigint[]) AS t(role_id)
            ON CONFLICT (assignment_id, user_id, lti_role_id) DO UPDATE SET updated = now()
            "#,
        )
        .bind(assignment_id)
        .bind(user_id)
        .bind(role_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_course_memberships(
        &self,
        course_id: i64,
        user_id: i64,
        role_ids: &[i64],
    ) -> Result<(), ServiceError> {
        if role_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO course_memberships (course_id, user_id, lti_role_id)
            SELECT $1, $2, role_id FROM UNNEST($3::bigint[]) AS t(role_id)
            ON CONFLICT (course_id, user_id, lti_role_id) DO UPDATE SET updated = now()
            "#,
        )
        .bind(course_id)
        .bind(user_id)
        .bind(role_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One row per grouping the user was seen in.
    pub async fn upsert_grouping_memberships(
        &self,
        user_id: i64,
        grouping_ids: &[i64],
    ) -> Result<(), ServiceError> {
        if grouping_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO grouping_memberships (grouping_id, user_id)
            SELECT grouping_id, $1 FROM UNNEST($2::bigint[]) AS t(grouping_id)
            ON CONFLICT (grouping_id, user_id) DO UPDATE SET updated = now()
            "#,
        )
        .bind(user_id)
        .bind(grouping_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Role Operations ====================

    pub async fn find_role_by_value(
        &self,
        value: &str,
    ) -> Result<Option<LtiRole>, ServiceError> {
        let role = sqlx::query_as::<_, LtiRole>("SELECT * FROM lti_roles WHERE value = $1")
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    pub async fn insert_role(
        &self,
        value: &str,
        scope: RoleScope,
        kind: RoleKind,
    ) -> Result<LtiRole, ServiceError> {
        // Concurrent launches may race on the same new value; the conflict
        // no-op update lets both get the row back.
        let role = sqlx::query_as::<_, LtiRole>(
            r#"
            INSERT INTO lti_roles (value, scope, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (value) DO UPDATE SET value = EXCLUDED.value
            RETURNING *
            "#,
        )
        .bind(value)
        .bind(scope.as_str())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(role)
    }

    pub async fn find_role_overrides(
        &self,
        tenant_id: i64,
    ) -> Result<HashMap<String, (RoleScope, RoleKind)>, ServiceError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT value, scope, kind FROM lti_role_overrides WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(value, scope, kind)| {
                Some((
                    value,
                    (RoleScope::parse(&scope)?, RoleKind::parse(&kind)?),
                ))
            })
            .collect())
    }

    // ==================== Roster Operations ====================

    /// Replace a course roster in one transaction: flip every existing row to
    /// inactive, then upsert the fetched members. Nothing is deleted.
    pub async fn replace_course_roster(
        &self,
        course_id: i64,
        rows: &[PreparedRosterRow],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE course_rosters SET active = FALSE, updated = now() WHERE course_id = $1")
            .bind(course_id)
            .execute(&mut *tx)
            .await?;

        if !rows.is_empty() {
            let user_ids: Vec<i64> = rows.iter().map(|r| r.user_id).collect();
            let role_ids: Vec<i64> = rows.iter().map(|r| r.lti_role_id).collect();
            let actives: Vec<bool> = rows.iter().map(|r| r.active).collect();
            sqlx::query(
                r#"
                INSERT INTO course_rosters (course_id, user_id, lti_role_id, active)
                SELECT $1, t.user_id, t.lti_role_id, t.active
                FROM UNNEST($2::bigint[], $3::bigint[], $4::bool[]) AS t(user_id, lti_role_id, active)
                ON CONFLICT (course_id, user_id, lti_role_id) DO UPDATE SET
                    active = EXCLUDED.active,
                    updated = now()
                "#,
            )
            .bind(course_id)
            .bind(&user_ids)
            .bind(&role_ids)
            .bind(&actives)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn replace_assignment_roster(
        &self,
        assignment_id: i64,
        rows: &[PreparedRosterRow],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE assignment_rosters SET active = FALSE, updated = now() WHERE assignment_id = $1",
        )
        .bind(assignment_id)
        .execute(&mut *tx)
        .await?;

        if !rows.is_empty() {
            let user_ids: Vec<i64> = rows.iter().map(|r| r.user_id).collect();
            let role_ids: Vec<i64> = rows.iter().map(|r| r.lti_role_id).collect();
            let actives: Vec<bool> = rows.iter().map(|r| r.active).collect();
            sqlx::query(
                r#"
                INSERT INTO assignment_rosters (assignment_id, user_id, lti_role_id, active)
                SELECT $1, t.user_id, t.lti_role_id, t.active
                FROM UNNEST($2::bigint[], $3::bigint[], $4::bool[]) AS t(user_id, lti_role_id, active)
                ON CONFLICT (assignment_id, user_id, lti_role_id) DO UPDATE SET
                    active = EXCLUDED.active,
                    updated = now()
                "#,
            )
            .bind(assignment_id)
            .bind(&user_ids)
            .bind(&role_ids)
            .bind(&actives)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn course_roster(&self, course_id: i64) -> Result<Vec<RosterRow>, ServiceError> {
        let rows = sqlx::query_as::<_, RosterRow>(
            "SELECT id, user_id, lti_role_id, active, updated FROM course_rosters WHERE course_id = $1",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ==================== OAuth2 Token Operations ====================

    pub async fn find_oauth2_token(
        &self,
        tenant_id: i64,
        user_id: i64,
    ) -> Result<Option<OAuth2Token>, ServiceError> {
        let token = sqlx::query_as::<_, OAuth2Token>(
            "SELECT * FROM oauth2_tokens WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    pub async fn upsert_oauth2_token(
        &self,
        tenant_id: i64,
        user_id: i64,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: Option<i64>,
    ) -> Result<OAuth2Token, ServiceError> {
        let token = sqlx::query_as::<_, OAuth2Token>(
            r#"
            INSERT INTO oauth2_tokens (tenant_id, user_id, access_token, refresh_token, expires_in, received_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (tenant_id, user_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, oauth2_tokens.refresh_token),
                expires_in = EXCLUDED.expires_in,
                received_at = now()
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_in)
        .fetch_one(&self.pool)
        .await?;
        Ok(token)
    }

    pub async fn delete_oauth2_token(&self, token_id: i64) -> Result<(), ServiceError> {
        sqlx::query("DELETE FROM oauth2_tokens WHERE id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Serialize a refresh against concurrent launches for the same token
    /// row. The advisory lock is transaction-scoped: the winner refreshes
    /// inside `refresh_fn` and commits; losers block on the lock, then
    /// re-read and observe the refreshed row.
    pub async fn with_token_row_lock<F, Fut, T>(
        &self,
        token_id: i64,
        refresh_fn: F,
    ) -> Result<T, ServiceError>
    where
        F: FnOnce(Database) -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        let result = refresh_fn(self.clone()).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    // ==================== RSA Key Operations ====================

    pub async fn insert_rsa_key(
        &self,
        kid: Uuid,
        public_jwk: &Value,
        private_pem: &str,
    ) -> Result<RsaKey, ServiceError> {
        let key = sqlx::query_as::<_, RsaKey>(
            r#"
            INSERT INTO rsa_keys (kid, public_jwk, private_pem, active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING *
            "#,
        )
        .bind(kid)
        .bind(public_jwk)
        .bind(private_pem)
        .fetch_one(&self.pool)
        .await?;
        Ok(key)
    }

    /// The newest active key, used for signing.
    pub async fn active_rsa_key(&self) -> Result<Option<RsaKey>, ServiceError> {
        let key = sqlx::query_as::<_, RsaKey>(
            "SELECT * FROM rsa_keys WHERE active = TRUE ORDER BY created DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    /// Every key ever created, newest first, for the published JWKS.
    pub async fn all_rsa_keys(&self) -> Result<Vec<RsaKey>, ServiceError> {
        let keys =
            sqlx::query_as::<_, RsaKey>("SELECT * FROM rsa_keys ORDER BY created DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }

    /// Rotate: retire current active keys and insert a fresh one.
    pub async fn rotate_rsa_key(
        &self,
        kid: Uuid,
        public_jwk: &Value,
        private_pem: &str,
    ) -> Result<RsaKey, ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE rsa_keys SET active = FALSE WHERE active = TRUE")
            .execute(&mut *tx)
            .await?;
        let key = sqlx::query_as::<_, RsaKey>(
            r#"
            INSERT INTO rsa_keys (kid, public_jwk, private_pem, active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING *
            "#,
        )
        .bind(kid)
        .bind(public_jwk)
        .bind(private_pem)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(key)
    }

    // ==================== Nonce Operations ====================

    /// Claim a nonce key until `expires_at`. Returns false when the key was
    /// already claimed and has not expired (a replay).
    pub async fn try_claim_nonce(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO seen_nonces (key, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            WHERE seen_nonces.expires_at < now()
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_expired_nonces(&self) -> Result<u64, ServiceError> {
        let result = sqlx::query("DELETE FROM seen_nonces WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
