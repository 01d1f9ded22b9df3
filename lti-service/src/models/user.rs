//! LMS user model - per-tenant identities keyed by a stable hash.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// A user as seen through launches and roster fetches for one tenant.
///
/// `h_userid` is the stable `acct:<30 hex>@<authority>` identifier derived
/// from the installation guid and the LMS user id; it never changes between
/// launches of the same person.
#[derive(Debug, Clone, FromRow)]
pub struct LmsUser {
    pub id: i64,
    pub tenant_id: i64,
    pub lti_user_id: String,
    pub h_userid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub roles_cached: Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}
