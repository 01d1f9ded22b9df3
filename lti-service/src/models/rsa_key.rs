//! Tool-side RSA signing keys.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// One RS256 signing key. Rotation inserts a new active key and retires the
/// old one; retired keys remain available so platforms can verify assertions
/// signed before the rotation.
#[derive(Debug, Clone, FromRow)]
pub struct RsaKey {
    pub kid: Uuid,
    pub public_jwk: Value,
    pub private_pem: String,
    pub active: bool,
    pub created: DateTime<Utc>,
}
