//! LTI Advantage service client.
//!
//! Platform service calls (NRPS, AGS) authenticate with short-lived bearer
//! tokens obtained through the client-credentials grant: the tool signs a JWT
//! assertion with its active RSA key and trades it at the tenant's token
//! endpoint. Bearers are cached per `(tenant, scope-set)` with a single
//! in-flight grant per cache key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{EXPIRY_SAFETY_MARGIN_SECS, Tenant};
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::keys::sign_rs256;

pub const NRPS_SCOPE: &str =
    "https://purl.imsglobal.org/spec/lti-nrps/scope/contextmembership.readonly";
pub const AGS_SCORE_SCOPE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";

pub const NRPS_ACCEPT: &str = "application/vnd.ims.lti-nrps.v2.membershipcontainer+json";

const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
/// Lifetime of the signed assertion itself.
const ASSERTION_TTL_SECS: i64 = 60;
/// Transient grant and API failures retry at most this many times.
const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Clone)]
struct CachedBearer {
    access_token: String,
    expires_at: i64,
}

impl CachedBearer {
    fn is_valid(&self) -> bool {
        Utc::now().timestamp() < self.expires_at
    }
}

/// One NRPS membership container page.
#[derive(Debug, Deserialize)]
pub struct MembershipContainer {
    #[serde(default)]
    pub members: Vec<Member>,
}

/// One member of an NRPS roster.
#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub lti11_legacy_user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
}

impl Member {
    pub fn is_active(&self) -> bool {
        // Absent status means active per the NRPS spec.
        self.status.as_deref().map_or(true, |s| s == "Active")
    }

    /// The id used for identity hashing: the 1.1-era id wins when the
    /// platform migrated, keeping `h_userid` stable across the upgrade.
    pub fn stable_user_id(&self) -> &str {
        self.lti11_legacy_user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.user_id)
    }
}

#[derive(Clone)]
pub struct AdvantageService {
    db: Database,
    http_client: reqwest::Client,
    bearer_cache: Arc<DashMap<(i64, String), CachedBearer>>,
    grant_locks: Arc<DashMap<(i64, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl AdvantageService {
    pub fn new(db: Database, http_client: reqwest::Client) -> Self {
        Self {
            db,
            http_client,
            bearer_cache: Arc::new(DashMap::new()),
            grant_locks: Arc::new(DashMap::new()),
        }
    }

    /// A bearer token for `scopes` at this tenant, from cache when possible.
    /// Concurrent misses for the same key coalesce into one grant.
    pub async fn bearer_token(
        &self,
        tenant: &Tenant,
        scopes: &[&str],
    ) -> Result<String, ServiceError> {
        let cache_key = (tenant.id, scopes.join(" "));
        if let Some(cached) = self.bearer_cache.get(&cache_key) {
            if cached.is_valid() {
                return Ok(cached.access_token.clone());
            }
        }

        let lock = self
            .grant_locks
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(cached) = self.bearer_cache.get(&cache_key) {
            if cached.is_valid() {
                return Ok(cached.access_token.clone());
            }
        }

        let granted = self.grant(tenant, &cache_key.1).await?;
        let expires_at = Utc::now().timestamp() + granted.expires_in.unwrap_or(3600)
            - EXPIRY_SAFETY_MARGIN_SECS;
        self.bearer_cache.insert(
            cache_key,
            CachedBearer {
                access_token: granted.access_token.clone(),
                expires_at,
            },
        );
        Ok(granted.access_token)
    }

    async fn grant(&self, tenant: &Tenant, scope: &str) -> Result<GrantResponse, ServiceError> {
        let token_url = tenant
            .token_url
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;
        let client_id = tenant
            .client_id
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;
        // Some platforms want their issuer, not the token URL, as audience.
        let audience = tenant.ltia_aud.as_deref().unwrap_or(token_url);

        let key = self
            .db
            .active_rsa_key()
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("no active signing key")))?;

        let mut attempt = 0;
        loop {
            let now = Utc::now().timestamp();
            let assertion = sign_rs256(
                &key,
                &AssertionClaims {
                    iss: client_id,
                    sub: client_id,
                    aud: audience,
                    iat: now,
                    exp: now + ASSERTION_TTL_SECS,
                    jti: Uuid::new_v4().to_string(),
                },
            )?;

            let result = self
                .http_client
                .post(token_url)
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_assertion_type", ASSERTION_TYPE),
                    ("client_assertion", &assertion),
                    ("scope", scope),
                ])
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(tenant_id = tenant.id, scope, "obtained advantage bearer");
                    return Ok(response.json().await?);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ServiceError::ExternalApi { status, body });
                }
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(tenant_id = tenant.id, attempt, error = %err, "token grant failed, retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Fetch an NRPS membership container, following the resource-link filter
    /// when given. Transient failures retry with backoff.
    pub async fn fetch_memberships(
        &self,
        tenant: &Tenant,
        memberships_url: &str,
        resource_link_id: Option<&str>,
    ) -> Result<MembershipContainer, ServiceError> {
        let bearer = self.bearer_token(tenant, &[NRPS_SCOPE]).await?;

        let mut attempt = 0;
        loop {
            let mut request = self
                .http_client
                .get(memberships_url)
                .bearer_auth(&bearer)
                .header(reqwest::header::ACCEPT, NRPS_ACCEPT);
            if let Some(rlid) = resource_link_id {
                request = request.query(&[("rlid", rlid)]);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json().await?);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ServiceError::ExternalApi { status, body });
                }
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %err, "NRPS fetch failed, retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// POST a JSON document to a platform service endpoint (AGS scores).
    pub async fn post_json(
        &self,
        tenant: &Tenant,
        url: &str,
        scopes: &[&str],
        content_type: &str,
        body: &Value,
    ) -> Result<(), ServiceError> {
        let bearer = self.bearer_token(tenant, scopes).await?;
        let response = self
            .http_client
            .post(url)
            .bearer_auth(&bearer)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::ExternalApi {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_status_defaults_to_active() {
        let member: Member = serde_json::from_value(json!({
            "user_id": "u-13",
        }))
        .unwrap();
        assert!(member.is_active());

        let inactive: Member = serde_json::from_value(json!({
            "user_id": "u-13",
            "status": "Inactive",
        }))
        .unwrap();
        assert!(!inactive.is_active());
    }

    #[test]
    fn legacy_user_id_wins_for_identity() {
        let migrated: Member = serde_json::from_value(json!({
            "user_id": "new-sub",
            "lti11_legacy_user_id": "legacy-user",
        }))
        .unwrap();
        assert_eq!(migrated.stable_user_id(), "legacy-user");

        let native: Member = serde_json::from_value(json!({
            "user_id": "new-sub",
            "lti11_legacy_user_id": "",
        }))
        .unwrap();
        assert_eq!(native.stable_user_id(), "new-sub");
    }

    #[test]
    fn membership_container_tolerates_missing_members() {
        let container: MembershipContainer = serde_json::from_value(json!({
            "id": "https://lms/api/nrps/v2/courses/1",
        }))
        .unwrap();
        assert!(container.members.is_empty());
    }

    #[test]
    fn cached_bearer_expiry() {
        let valid = CachedBearer {
            access_token: "b".to_string(),
            expires_at: Utc::now().timestamp() + 60,
        };
        assert!(valid.is_valid());
        let expired = CachedBearer {
            access_token: "b".to_string(),
            expires_at: Utc::now().timestamp() - 1,
        };
        assert!(!expired.is_valid());
    }
}
