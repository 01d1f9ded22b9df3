//! Launch verification.
//!
//! LTI 1.1 launches arrive as OAuth 1.0a signed form posts; LTI 1.3 launches
//! as RS256 JWTs verified against the platform's published JWKS. Both paths
//! resolve the tenant, enforce replay protection, and hand back a normalized
//! `LaunchPayload` plus the tenant row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::Tenant;
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::oauth1;
use crate::services::payload::{CLAIM_VERSION, LaunchPayload};

/// Replay window for nonces; a nonce may not repeat within it.
const NONCE_WINDOW_SECS: i64 = 300;
/// Accepted `oauth_timestamp` drift: up to this far in the past...
const TIMESTAMP_MAX_AGE_SECS: i64 = 300;
/// ...and this far into the future.
const TIMESTAMP_MAX_SKEW_SECS: i64 = 60;
/// Clock leeway applied to JWT `exp`/`iat`/`nbf`.
const JWT_LEEWAY_SECS: u64 = 30;
/// How long a fetched platform key set is reused before refetching.
const JWKS_TTL: Duration = Duration::from_secs(3600);
/// Transport failures on the key set endpoint are retried this many times.
const MAX_RETRIES: u32 = 2;
/// Base delay between retries; doubles each attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < JWKS_TTL
    }

    fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid))
    }
}

#[derive(Clone)]
pub struct VerificationService {
    db: Database,
    http_client: reqwest::Client,
    jwks_cache: Arc<DashMap<String, Arc<CachedJwks>>>,
    // One fetch in flight per JWKS URL; concurrent launches wait on it.
    jwks_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VerificationService {
    pub fn new(db: Database, http_client: reqwest::Client) -> Self {
        Self {
            db,
            http_client,
            jwks_cache: Arc::new(DashMap::new()),
            jwks_locks: Arc::new(DashMap::new()),
        }
    }

    // ==================== LTI 1.1 ====================

    /// Verify a signed LTI 1.1 form post against the launch URL it was
    /// posted to. Returns the tenant and the normalized payload.
    pub async fn verify_lti11(
        &self,
        launch_url: &str,
        params: &[(String, String)],
    ) -> Result<(Tenant, LaunchPayload), ServiceError> {
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let lti_version = get("lti_version").unwrap_or_default();
        if lti_version != "LTI-1p0" {
            return Err(ServiceError::UnsupportedLtiVersion(lti_version.to_string()));
        }

        let consumer_key = get("oauth_consumer_key")
            .ok_or_else(|| ServiceError::MissingRequiredClaim("oauth_consumer_key".to_string()))?;
        let tenant = self
            .db
            .find_tenant_by_consumer_key(consumer_key)
            .await?
            .ok_or(ServiceError::UnknownTenant)?;
        let shared_secret = tenant
            .shared_secret
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;

        let timestamp: i64 = get("oauth_timestamp")
            .and_then(|t| t.parse().ok())
            .ok_or(ServiceError::StaleTimestamp)?;
        let now = Utc::now().timestamp();
        if timestamp < now - TIMESTAMP_MAX_AGE_SECS || timestamp > now + TIMESTAMP_MAX_SKEW_SECS {
            return Err(ServiceError::StaleTimestamp);
        }

        let supplied_signature = get("oauth_signature").ok_or(ServiceError::BadSignature)?;
        oauth1::verify_signature(
            "POST",
            launch_url,
            params,
            shared_secret,
            supplied_signature,
        )?;

        // Nonce is claimed only after the signature checks out, so attackers
        // cannot burn nonces for legitimate launches.
        let nonce = get("oauth_nonce").ok_or(ServiceError::BadSignature)?;
        self.claim_nonce(&format!("11:{}:{}", consumer_key, nonce))
            .await?;

        let param_map: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let payload = LaunchPayload::from_form_params(param_map);

        let tenant = self.align_tenant_guid(tenant, &payload).await?;
        self.db.touch_tenant(tenant.id).await?;
        info!(tenant_id = tenant.id, "verified LTI 1.1 launch");
        Ok((tenant, payload))
    }

    // ==================== LTI 1.3 ====================

    /// Verify an LTI 1.3 `id_token`. The `expected_nonce`, when given, is the
    /// value the tool issued during the OIDC handshake.
    pub async fn verify_lti13(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<(Tenant, LaunchPayload), ServiceError> {
        let header = decode_header(id_token)
            .map_err(|e| ServiceError::InvalidJwt(format!("bad JWT header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(ServiceError::InvalidJwt(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| ServiceError::InvalidJwt("missing kid".to_string()))?;

        // Peek at iss/aud without verifying, to resolve the tenant and its
        // key set URL. Nothing from this pass is trusted.
        let (issuer, client_id) = peek_issuer_audience(id_token)?;
        let tenant = self
            .db
            .find_tenant_by_issuer_client_id(&issuer, &client_id)
            .await?
            .ok_or(ServiceError::UnknownTenant)?;
        let jwks_url = tenant
            .jwks_url
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;

        let jwk = self.platform_key(jwks_url, &kid).await?;
        let decoding_key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| ServiceError::InvalidJwt(format!("unusable platform key: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = JWT_LEEWAY_SECS;
        validation.set_audience(&[&client_id]);
        validation.set_issuer(&[&issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let token_data = decode::<Value>(id_token, &decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => ServiceError::ExpiredJwt,
                _ => ServiceError::InvalidJwt(e.to_string()),
            }
        })?;
        let claims = token_data.claims;
        validate_issued_at(&claims, Utc::now().timestamp())?;

        let version = claims
            .get(CLAIM_VERSION)
            .and_then(Value::as_str)
            .unwrap_or_default();
        if version != "1.3.0" {
            return Err(ServiceError::UnsupportedLtiVersion(version.to_string()));
        }

        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::MissingRequiredClaim("nonce".to_string()))?;
        if let Some(expected) = expected_nonce {
            if nonce != expected {
                return Err(ServiceError::InvalidJwt("nonce mismatch".to_string()));
            }
        }
        self.claim_nonce(&format!("13:{}:{}:{}", issuer, client_id, nonce))
            .await?;

        let payload = LaunchPayload::from_jwt_claims(claims);
        let tenant = self.align_tenant_guid(tenant, &payload).await?;
        self.db.touch_tenant(tenant.id).await?;
        info!(tenant_id = tenant.id, "verified LTI 1.3 launch");
        Ok((tenant, payload))
    }

    // ==================== Shared ====================

    async fn claim_nonce(&self, key: &str) -> Result<(), ServiceError> {
        let expires_at = Utc::now() + chrono::Duration::seconds(NONCE_WINDOW_SECS);
        if self.db.try_claim_nonce(key, expires_at).await? {
            Ok(())
        } else {
            warn!("rejected replayed nonce");
            Err(ServiceError::ReplayedNonce)
        }
    }

    /// Learn the installation guid on first launch; afterwards a different
    /// guid means the credentials were copied to another install, unless the
    /// tenant explicitly allows realignment.
    async fn align_tenant_guid(
        &self,
        mut tenant: Tenant,
        payload: &LaunchPayload,
    ) -> Result<Tenant, ServiceError> {
        let Some(launch_guid) = payload.tool_consumer_instance_guid() else {
            return Ok(tenant);
        };

        match tenant.tool_consumer_instance_guid.as_deref() {
            None => {
                info!(tenant_id = tenant.id, "learning installation guid");
                self.db.learn_tenant_guid(tenant.id, launch_guid).await?;
                tenant.tool_consumer_instance_guid = Some(launch_guid.to_string());
                Ok(tenant)
            }
            Some(known) if known == launch_guid => Ok(tenant),
            Some(_) if tenant.allow_guid_realignment => {
                warn!(tenant_id = tenant.id, "realigning installation guid");
                self.db.learn_tenant_guid(tenant.id, launch_guid).await?;
                tenant.tool_consumer_instance_guid = Some(launch_guid.to_string());
                Ok(tenant)
            }
            Some(_) => Err(ServiceError::ReusedGuid),
        }
    }

    /// Resolve a platform key by kid, fetching the key set when the cache is
    /// cold, stale, or does not know the kid (a rotation).
    async fn platform_key(&self, jwks_url: &str, kid: &str) -> Result<Jwk, ServiceError> {
        if let Some(cached) = self.jwks_cache.get(jwks_url) {
            if cached.is_fresh() {
                if let Some(jwk) = cached.find(kid) {
                    return Ok(jwk.clone());
                }
            }
        }

        let lock = self
            .jwks_locks
            .entry(jwks_url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another launch may have refreshed while we waited.
        if let Some(cached) = self.jwks_cache.get(jwks_url) {
            if cached.is_fresh() {
                if let Some(jwk) = cached.find(kid) {
                    return Ok(jwk.clone());
                }
            }
        }

        debug!(jwks_url, "fetching platform key set");
        let mut attempt = 0u32;
        let response = loop {
            match self.http_client.get(jwks_url).send().await {
                Ok(response) => break response,
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(jwks_url, attempt, error = %err, "key set fetch failed, retrying");
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        let body: Value = response.error_for_status()?.json().await?;
        let keys: Vec<Jwk> = body
            .get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    // Skip malformed entries rather than failing the set.
                    .filter_map(|k| serde_json::from_value(k.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let cached = Arc::new(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        self.jwks_cache.insert(jwks_url.to_string(), cached.clone());

        cached
            .find(kid)
            .cloned()
            .ok_or_else(|| ServiceError::InvalidJwt(format!("no platform key with kid {kid}")))
    }
}

/// Reject tokens issued in the future. `jsonwebtoken` checks `exp` and `nbf`
/// but never `iat`, so the check lives here, with the same clock leeway.
fn validate_issued_at(claims: &Value, now: i64) -> Result<(), ServiceError> {
    match claims.get("iat").and_then(Value::as_i64) {
        Some(iat) if iat > now + JWT_LEEWAY_SECS as i64 => Err(ServiceError::InvalidJwt(
            "iat is in the future".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Read iss and aud from an unverified token. `aud` may be a string or an
/// array; the first entry wins.
fn peek_issuer_audience(id_token: &str) -> Result<(String, String), ServiceError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Value>(id_token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| ServiceError::InvalidJwt(format!("undecodable JWT: {e}")))?;

    let issuer = data
        .claims
        .get("iss")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::MissingRequiredClaim("iss".to_string()))?
        .to_string();
    let audience = match data.claims.get("aud") {
        Some(Value::String(aud)) => aud.clone(),
        Some(Value::Array(auds)) => auds
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::MissingRequiredClaim("aud".to_string()))?
            .to_string(),
        _ => return Err(ServiceError::MissingRequiredClaim("aud".to_string())),
    };
    Ok((issuer, audience))
}
