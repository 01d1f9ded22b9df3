//! OAuth 2.0 token rows for outbound LMS API access.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

/// Safety margin subtracted from the advertised lifetime so tokens are
/// refreshed before the platform actually rejects them.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Access/refresh token pair for one `(tenant, user)`.
#[derive(Debug, Clone, FromRow)]
pub struct OAuth2Token {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub received_at: DateTime<Utc>,
}

impl OAuth2Token {
    /// Whether the access token should be treated as expired at `now`.
    ///
    /// Tokens with no advertised lifetime never expire client-side.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_in {
            Some(expires_in) => {
                let cutoff = self.received_at
                    + Duration::seconds(expires_in - EXPIRY_SAFETY_MARGIN_SECS);
                now >= cutoff
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: Option<i64>, received_secs_ago: i64) -> OAuth2Token {
        OAuth2Token {
            id: 1,
            tenant_id: 1,
            user_id: 1,
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in,
            received_at: Utc::now() - Duration::seconds(received_secs_ago),
        }
    }

    #[test]
    fn fresh_token_is_not_expired() {
        assert!(!token(Some(3600), 0).is_expired());
    }

    #[test]
    fn token_expires_one_safety_margin_early() {
        // 10s of nominal life left is inside the 60s margin.
        assert!(token(Some(3600), 3590).is_expired());
        // 120s left is outside it.
        assert!(!token(Some(3600), 3480).is_expired());
    }

    #[test]
    fn token_without_lifetime_never_expires() {
        assert!(!token(None, 999_999).is_expired());
    }
}
