//! OAuth 2.0 client and per-user token store.
//!
//! Brokered tokens let the tool call LMS APIs on a user's behalf. One row per
//! `(tenant, user)`; the row's states are absent, valid, and refreshing.
//! Refreshes are serialized by a row-keyed advisory lock so concurrent
//! launches never double-refresh.
//!
//! The authorization endpoints and client credentials come from the tenant's
//! `oauth2` settings group.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{OAuth2Token, Tenant};
use crate::services::database::Database;
use crate::services::error::ServiceError;

/// Lifetime of the signed state blob carried through the authorize redirect.
const STATE_TTL_SECS: i64 = 3600;
/// Transport failures on the token endpoint are retried this many times.
const MAX_RETRIES: u32 = 2;
/// Base delay between retries; doubles each attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Result of asking for a usable token.
#[derive(Debug)]
pub enum TokenOutcome {
    /// A valid (possibly just-refreshed) token.
    Ready(OAuth2Token),
    /// No usable token; send the browser here and resume after callback.
    Redirect { authorize_url: String, state: String },
}

/// Claims sealed into the `state` parameter of the authorize redirect.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthState {
    pub tenant_id: i64,
    pub user_id: i64,
    pub return_to: String,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

struct TenantOAuth2<'a> {
    authorize_url: &'a str,
    token_url: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
}

fn tenant_oauth2(tenant: &Tenant) -> Result<TenantOAuth2<'_>, ServiceError> {
    let get = |key: &str| {
        tenant
            .setting_str("oauth2", key)
            .ok_or(ServiceError::OAuth2NeedsAuthorization)
    };
    Ok(TenantOAuth2 {
        authorize_url: get("authorize_url")?,
        token_url: get("token_url")?,
        client_id: get("client_id")?,
        client_secret: get("client_secret")?,
        redirect_uri: get("redirect_uri")?,
    })
}

#[derive(Clone)]
pub struct OAuth2Service {
    db: Database,
    http_client: reqwest::Client,
    state_secret: String,
}

impl OAuth2Service {
    pub fn new(db: Database, http_client: reqwest::Client, state_secret: String) -> Self {
        Self {
            db,
            http_client,
            state_secret,
        }
    }

    /// Return a usable token, refreshing an expired one, or the redirect that
    /// begins the authorization-code flow.
    pub async fn get_or_begin_auth(
        &self,
        tenant: &Tenant,
        user_id: i64,
        return_to: &str,
    ) -> Result<TokenOutcome, ServiceError> {
        match self.db.find_oauth2_token(tenant.id, user_id).await? {
            Some(token) if !token.is_expired() => Ok(TokenOutcome::Ready(token)),
            Some(token) if token.refresh_token.is_some() => {
                match self.refresh(tenant, &token).await {
                    Ok(refreshed) => Ok(TokenOutcome::Ready(refreshed)),
                    Err(ServiceError::OAuth2RefreshFailed) => {
                        self.begin_auth(tenant, user_id, return_to)
                    }
                    Err(other) => Err(other),
                }
            }
            _ => self.begin_auth(tenant, user_id, return_to),
        }
    }

    fn begin_auth(
        &self,
        tenant: &Tenant,
        user_id: i64,
        return_to: &str,
    ) -> Result<TokenOutcome, ServiceError> {
        let oauth2 = tenant_oauth2(tenant)?;
        let state = self.seal_state(&AuthState {
            tenant_id: tenant.id,
            user_id,
            return_to: return_to.to_string(),
            exp: Utc::now().timestamp() + STATE_TTL_SECS,
        })?;

        // Plain code flow; the platforms this serves predate PKCE support.
        let authorize_url = format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&state={}",
            oauth2.authorize_url,
            urlencoding::encode(oauth2.client_id),
            urlencoding::encode(oauth2.redirect_uri),
            urlencoding::encode(&state),
        );
        Ok(TokenOutcome::Redirect {
            authorize_url,
            state,
        })
    }

    /// Exchange the authorization code and persist the token row. Returns the
    /// row and the sealed `return_to` so the caller can resume the launch.
    pub async fn handle_callback(
        &self,
        tenant: &Tenant,
        code: &str,
        state: &str,
    ) -> Result<(OAuth2Token, String), ServiceError> {
        let auth_state = self.unseal_state(state)?;
        if auth_state.tenant_id != tenant.id {
            return Err(ServiceError::InvalidJwt("state tenant mismatch".to_string()));
        }

        let oauth2 = tenant_oauth2(tenant)?;
        let response = self
            .http_client
            .post(oauth2.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", oauth2.client_id),
                ("client_secret", oauth2.client_secret),
                ("redirect_uri", oauth2.redirect_uri),
            ])
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
        let granted: TokenResponse = response.json().await?;

        let token = self
            .db
            .upsert_oauth2_token(
                tenant.id,
                auth_state.user_id,
                &granted.access_token,
                granted.refresh_token.as_deref(),
                granted.expires_in,
            )
            .await?;
        info!(
            tenant_id = tenant.id,
            user_id = auth_state.user_id,
            "stored OAuth2 token from callback"
        );
        Ok((token, auth_state.return_to))
    }

    /// Refresh an expired token. Concurrent callers are serialized on the
    /// token row: the winner talks to the LMS, losers block and then re-read
    /// the refreshed row.
    ///
    /// The refresh runs in its own task. A caller that gives up mid-flight
    /// does not abort it: once the POST has gone out, the new token is
    /// committed (or the dead row deleted) regardless.
    pub async fn refresh(
        &self,
        tenant: &Tenant,
        token: &OAuth2Token,
    ) -> Result<OAuth2Token, ServiceError> {
        let db = self.db.clone();
        let tenant = tenant.clone();
        let token_id = token.id;
        let user_id = token.user_id;
        let http_client = self.http_client.clone();

        let task = tokio::spawn(async move {
            db.with_token_row_lock(token_id, move |db| async move {
                // Whoever held the lock before us may have refreshed already.
                let current = db
                    .find_oauth2_token(tenant.id, user_id)
                    .await?
                    .ok_or(ServiceError::OAuth2NeedsAuthorization)?;
                if !current.is_expired() {
                    return Ok(current);
                }
                let refresh_token = current
                    .refresh_token
                    .as_deref()
                    .ok_or(ServiceError::OAuth2RefreshFailed)?;

                let oauth2 = tenant_oauth2(&tenant)?;
                let response = post_form_with_retry(
                    &http_client,
                    oauth2.token_url,
                    &[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                        ("client_id", oauth2.client_id),
                        ("client_secret", oauth2.client_secret),
                    ],
                )
                .await?;
                let status = response.status();

                if status.as_u16() == 400 || status.as_u16() == 401 {
                    // The grant is dead; drop the row so the user re-auths.
                    warn!(token_id, status = status.as_u16(), "refresh token rejected");
                    db.delete_oauth2_token(current.id).await?;
                    return Err(ServiceError::OAuth2RefreshFailed);
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ServiceError::ExternalApi {
                        status: status.as_u16(),
                        body,
                    });
                }

                let granted: TokenResponse = response.json().await?;
                db.upsert_oauth2_token(
                    tenant.id,
                    user_id,
                    &granted.access_token,
                    granted.refresh_token.as_deref(),
                    granted.expires_in,
                )
                .await
            })
            .await
        });

        task.await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("refresh task failed: {e}")))?
    }

    fn seal_state(&self, state: &AuthState) -> Result<String, ServiceError> {
        seal_state(&self.state_secret, state)
    }

    fn unseal_state(&self, state: &str) -> Result<AuthState, ServiceError> {
        unseal_state(&self.state_secret, state)
    }
}

/// Sign the state blob as a compact HS256 JWT.
fn seal_state(secret: &str, state: &AuthState) -> Result<String, ServiceError> {
    encode(
        &Header::new(Algorithm::HS256),
        state,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ServiceError::Internal(anyhow::anyhow!("failed to seal state: {e}")))
}

/// Verify and open a sealed state blob. Tampered or expired blobs fail.
fn unseal_state(secret: &str, state: &str) -> Result<AuthState, ServiceError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);
    let data = decode::<AuthState>(
        state,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| ServiceError::InvalidJwt(format!("bad auth state: {e}")))?;
    Ok(data.claims)
}

/// POST a form, retrying transport failures with exponential backoff. HTTP
/// error statuses are returned to the caller, not retried.
async fn post_form_with_retry(
    client: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> Result<reqwest::Response, ServiceError> {
    let mut attempt = 0u32;
    loop {
        match client.post(url).form(form).send().await {
            Ok(response) => return Ok(response),
            Err(err) if attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(url, attempt, error = %err, "token endpoint unreachable, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn state_round_trips_through_seal_and_unseal() {
        let sealed = seal_state(
            "state-secret",
            &AuthState {
                tenant_id: 7,
                user_id: 41,
                return_to: "/assignments/3".to_string(),
                exp: Utc::now().timestamp() + 600,
            },
        )
        .unwrap();

        let state = unseal_state("state-secret", &sealed).unwrap();
        assert_eq!(state.tenant_id, 7);
        assert_eq!(state.user_id, 41);
        assert_eq!(state.return_to, "/assignments/3");
    }

    #[test]
    fn tampered_state_is_rejected() {
        let sealed = seal_state(
            "state-secret",
            &AuthState {
                tenant_id: 7,
                user_id: 41,
                return_to: "/".to_string(),
                exp: Utc::now().timestamp() + 600,
            },
        )
        .unwrap();

        assert!(matches!(
            unseal_state("different-secret", &sealed),
            Err(ServiceError::InvalidJwt(_))
        ));
    }

    #[test]
    fn expired_state_is_rejected() {
        let sealed = seal_state(
            "state-secret",
            &AuthState {
                tenant_id: 7,
                user_id: 41,
                return_to: "/".to_string(),
                exp: Utc::now().timestamp() - 120,
            },
        )
        .unwrap();
        assert!(unseal_state("state-secret", &sealed).is_err());
    }

    #[tokio::test]
    async fn token_post_retries_transport_failures() {
        // A listener that hangs up without answering produces a transport
        // error on every attempt; each connection is counted.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let client = reqwest::Client::new();
        let result = post_form_with_retry(
            &client,
            &format!("http://{addr}/token"),
            &[("grant_type", "refresh_token")],
        )
        .await;

        assert!(matches!(result, Err(ServiceError::Http(_))));
        assert_eq!(connections.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn token_post_does_not_retry_http_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = post_form_with_retry(
            &client,
            &format!("{}/token", server.uri()),
            &[("grant_type", "refresh_token")],
        )
        .await
        .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn token_endpoint_shape_matches_refresh_grant() {
        // Exercises the request shape the refresh path emits, without a
        // database: the same form post, matched strictly.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at-2",
                "refresh_token": "rt-2",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/token", server.uri()))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", "rt-1"),
                ("client_id", "cid"),
                ("client_secret", "cs"),
            ])
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let granted: TokenResponse = response.json().await.unwrap();
        assert_eq!(granted.access_token, "at-2");
        assert_eq!(granted.expires_in, Some(3600));
    }
}
