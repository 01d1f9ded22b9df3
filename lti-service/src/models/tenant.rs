//! Tenant model - one configured LMS integration.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// A registered LMS installation.
///
/// LTI 1.1 tenants are identified by `consumer_key`; LTI 1.3 tenants by the
/// `(issuer, client_id)` pair. `tool_consumer_instance_guid` is learned from
/// the first launch and guards against credential reuse across installs.
#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub id: i64,
    pub consumer_key: Option<String>,
    pub shared_secret: Option<String>,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub auth_login_url: Option<String>,
    pub token_url: Option<String>,
    pub jwks_url: Option<String>,
    pub ltia_aud: Option<String>,
    pub tool_consumer_instance_guid: Option<String>,
    pub allow_guid_realignment: bool,
    pub lms_product: Option<String>,
    pub settings: Value,
    pub last_launched_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Tenant {
    /// Look up a tenant setting as a string, e.g. `("canvas", "sections_enabled")`.
    pub fn setting_str(&self, group: &str, key: &str) -> Option<&str> {
        self.settings.get(group)?.get(key)?.as_str()
    }

    /// Look up a boolean tenant setting, falling back to `default`.
    pub fn setting_bool(&self, group: &str, key: &str, default: bool) -> bool {
        self.settings
            .get(group)
            .and_then(|g| g.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Whether this tenant is registered for LTI 1.3.
    pub fn is_lti_13(&self) -> bool {
        self.issuer.is_some() && self.client_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant_with_settings(settings: Value) -> Tenant {
        Tenant {
            id: 1,
            consumer_key: Some("key".to_string()),
            shared_secret: Some("secret".to_string()),
            issuer: None,
            client_id: None,
            auth_login_url: None,
            token_url: None,
            jwks_url: None,
            ltia_aud: None,
            tool_consumer_instance_guid: None,
            allow_guid_realignment: false,
            lms_product: None,
            settings,
            last_launched_at: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn setting_lookup_walks_group_then_key() {
        let tenant = tenant_with_settings(json!({
            "canvas": { "sections_enabled": true },
            "hypothesis": { "notes": "instructors_only" },
        }));

        assert!(tenant.setting_bool("canvas", "sections_enabled", false));
        assert_eq!(
            tenant.setting_str("hypothesis", "notes"),
            Some("instructors_only")
        );
        assert!(!tenant.setting_bool("canvas", "groups_enabled", false));
    }

    #[test]
    fn lti_13_requires_both_issuer_and_client_id() {
        let mut tenant = tenant_with_settings(json!({}));
        assert!(!tenant.is_lti_13());

        tenant.issuer = Some("https://canvas.example.com".to_string());
        assert!(!tenant.is_lti_13());

        tenant.client_id = Some("10000000000001".to_string());
        assert!(tenant.is_lti_13());
    }
}
