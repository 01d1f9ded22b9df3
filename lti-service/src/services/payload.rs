//! Canonical launch payload.
//!
//! One representation for both wire formats: LTI 1.1 form posts are taken
//! verbatim, LTI 1.3 JWT claims are mapped onto the 1.1 key space so every
//! consumer reads through the same accessors. The original decoded JWT is
//! retained for 1.3 launches.

use std::collections::HashMap;

use serde_json::Value;

use crate::services::error::ServiceError;

// LTI 1.3 claim URIs.
pub const CLAIM_MESSAGE_TYPE: &str = "https://purl.imsglobal.org/spec/lti/claim/message_type";
pub const CLAIM_VERSION: &str = "https://purl.imsglobal.org/spec/lti/claim/version";
pub const CLAIM_ROLES: &str = "https://purl.imsglobal.org/spec/lti/claim/roles";
pub const CLAIM_CONTEXT: &str = "https://purl.imsglobal.org/spec/lti/claim/context";
pub const CLAIM_RESOURCE_LINK: &str = "https://purl.imsglobal.org/spec/lti/claim/resource_link";
pub const CLAIM_TOOL_PLATFORM: &str = "https://purl.imsglobal.org/spec/lti/claim/tool_platform";
pub const CLAIM_CUSTOM: &str = "https://purl.imsglobal.org/spec/lti/claim/custom";
pub const CLAIM_LTI1P1: &str = "https://purl.imsglobal.org/spec/lti/claim/lti1p1";
pub const CLAIM_AGS_ENDPOINT: &str = "https://purl.imsglobal.org/spec/lti-ags/claim/endpoint";
pub const CLAIM_NRPS: &str =
    "https://purl.imsglobal.org/spec/lti-nrps/claim/namesroleservice";
pub const CLAIM_DEEP_LINKING: &str =
    "https://purl.imsglobal.org/spec/lti-dl/claim/deep_linking_settings";

const MEMBERSHIP_ROLE_PREFIX: &str = "http://purl.imsglobal.org/vocab/lis/v2/membership";

/// Which wire format produced this payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtiVersion {
    V11,
    V13,
}

/// A verified launch, normalized to the 1.1 parameter space.
#[derive(Debug, Clone)]
pub struct LaunchPayload {
    params: HashMap<String, String>,
    jwt_claims: Option<Value>,
    version: LtiVersion,
}

impl LaunchPayload {
    /// Build from LTI 1.1 form-POST parameters, verbatim.
    pub fn from_form_params(params: HashMap<String, String>) -> Self {
        Self {
            params,
            jwt_claims: None,
            version: LtiVersion::V11,
        }
    }

    /// Build from a verified LTI 1.3 id_token, applying the fixed claim
    /// mapping. The `lti1p1` migration claim wins for identity fields so ids
    /// stay stable across a platform's 1.1 to 1.3 upgrade.
    pub fn from_jwt_claims(claims: Value) -> Self {
        let mut params = HashMap::new();
        let lti1p1 = claims.get(CLAIM_LTI1P1).cloned().unwrap_or(Value::Null);

        let user_id = string_claim(&lti1p1, "user_id")
            .or_else(|| string_claim(&claims, "sub"));
        insert_opt(&mut params, "user_id", user_id);

        insert_opt(
            &mut params,
            "lis_person_name_given",
            string_claim(&claims, "given_name"),
        );
        insert_opt(
            &mut params,
            "lis_person_name_family",
            string_claim(&claims, "family_name"),
        );
        insert_opt(
            &mut params,
            "lis_person_name_full",
            string_claim(&claims, "name"),
        );
        insert_opt(
            &mut params,
            "lis_person_contact_email_primary",
            string_claim(&claims, "email"),
        );

        if let Some(roles) = claims.get(CLAIM_ROLES).and_then(Value::as_array) {
            let raw: Vec<String> = roles
                .iter()
                .filter_map(|r| r.as_str().map(str::to_string))
                .collect();
            params.insert("roles".to_string(), filter_roles(&raw).join(","));
        }

        let context = claims.get(CLAIM_CONTEXT).cloned().unwrap_or(Value::Null);
        let context_id =
            string_claim(&lti1p1, "context_id").or_else(|| string_claim(&context, "id"));
        insert_opt(&mut params, "context_id", context_id);
        insert_opt(&mut params, "context_title", string_claim(&context, "title"));

        let resource_link = claims
            .get(CLAIM_RESOURCE_LINK)
            .cloned()
            .unwrap_or(Value::Null);
        let resource_link_id = string_claim(&lti1p1, "resource_link_id")
            .or_else(|| string_claim(&resource_link, "id"));
        insert_opt(&mut params, "resource_link_id", resource_link_id);
        insert_opt(
            &mut params,
            "resource_link_title",
            string_claim(&resource_link, "title"),
        );
        insert_opt(
            &mut params,
            "resource_link_description",
            string_claim(&resource_link, "description"),
        );

        let platform = claims
            .get(CLAIM_TOOL_PLATFORM)
            .cloned()
            .unwrap_or(Value::Null);
        // Some platforms omit the guid; a tenant-configured custom
        // certification_guid parameter is accepted in its place.
        let guid = string_claim(&platform, "guid").or_else(|| {
            claims
                .get(CLAIM_CUSTOM)
                .and_then(|c| c.get("certification_guid"))
                .map(stringify)
        });
        insert_opt(&mut params, "tool_consumer_instance_guid", guid);
        insert_opt(
            &mut params,
            "tool_consumer_info_product_family_code",
            string_claim(&platform, "product_family_code"),
        );

        if let Some(endpoint) = claims.get(CLAIM_AGS_ENDPOINT) {
            insert_opt(
                &mut params,
                "lis_outcome_service_url",
                string_claim(endpoint, "lineitem"),
            );
        }
        insert_opt(
            &mut params,
            "lis_result_sourcedid",
            string_claim(&lti1p1, "result_sourcedid"),
        );

        if let Some(nrps) = claims.get(CLAIM_NRPS) {
            insert_opt(
                &mut params,
                "context_memberships_url",
                string_claim(nrps, "context_memberships_url"),
            );
        }

        if let Some(dl) = claims.get(CLAIM_DEEP_LINKING) {
            insert_opt(
                &mut params,
                "content_item_return_url",
                string_claim(dl, "deep_link_return_url"),
            );
        }

        insert_opt(
            &mut params,
            "lti_message_type",
            string_claim(&claims, CLAIM_MESSAGE_TYPE),
        );
        insert_opt(
            &mut params,
            "lti_version",
            string_claim(&claims, CLAIM_VERSION),
        );

        // Custom parameters keep their 1.1 `custom_` prefix. Canvas sends
        // integer custom values; stringification is total so downstream code
        // only ever sees strings.
        if let Some(custom) = claims.get(CLAIM_CUSTOM).and_then(Value::as_object) {
            for (key, value) in custom {
                params.insert(format!("custom_{}", key), stringify(value));
            }
        }

        Self {
            params,
            jwt_claims: Some(claims),
            version: LtiVersion::V13,
        }
    }

    pub fn version(&self) -> LtiVersion {
        self.version
    }

    /// The original decoded JWT, for 1.3 launches.
    pub fn jwt_claims(&self) -> Option<&Value> {
        self.jwt_claims.as_ref()
    }

    /// Read any parameter through the 1.1 key space.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Like `get`, but a missing value is a `MissingRequiredClaim` error.
    pub fn require(&self, key: &str) -> Result<&str, ServiceError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServiceError::MissingRequiredClaim(key.to_string()))
    }

    /// Override a parameter after construction (used by product quirks).
    pub fn set(&mut self, key: &str, value: String) {
        self.params.insert(key.to_string(), value);
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get("user_id")
    }

    /// Raw role strings, split on commas.
    pub fn roles(&self) -> Vec<&str> {
        self.get("roles")
            .map(|r| {
                r.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tool_consumer_instance_guid(&self) -> Option<&str> {
        self.get("tool_consumer_instance_guid")
    }

    pub fn context_id(&self) -> Option<&str> {
        self.get("context_id")
    }

    pub fn context_title(&self) -> Option<&str> {
        self.get("context_title")
    }

    pub fn resource_link_id(&self) -> Option<&str> {
        self.get("resource_link_id")
    }

    pub fn resource_link_title(&self) -> Option<&str> {
        self.get("resource_link_title")
    }

    pub fn resource_link_description(&self) -> Option<&str> {
        self.get("resource_link_description")
    }

    pub fn lis_outcome_service_url(&self) -> Option<&str> {
        self.get("lis_outcome_service_url")
    }

    pub fn lis_result_sourcedid(&self) -> Option<&str> {
        self.get("lis_result_sourcedid")
    }

    pub fn product_family_code(&self) -> Option<&str> {
        self.get("tool_consumer_info_product_family_code")
    }

    pub fn lti_version(&self) -> Option<&str> {
        self.get("lti_version")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.get("lti_message_type")
    }

    pub fn deep_link_return_url(&self) -> Option<&str> {
        self.get("content_item_return_url")
    }

    pub fn context_memberships_url(&self) -> Option<&str> {
        self.get("context_memberships_url")
    }

    /// Custom parameter lookup; `custom("foo")` reads `custom_foo`.
    pub fn custom(&self, key: &str) -> Option<&str> {
        self.get(&format!("custom_{}", key))
    }

    /// All custom parameters, without their `custom_` prefix.
    pub fn custom_params(&self) -> HashMap<&str, &str> {
        self.params
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("custom_").map(|name| (name, v.as_str()))
            })
            .collect()
    }

    /// Course-copy history ids, newest first.
    pub fn context_id_history(&self) -> Vec<&str> {
        self.history_param(&["custom_Context.id.history", "custom_context_id_history"])
    }

    /// Assignment-copy history ids, newest first.
    pub fn resource_link_id_history(&self) -> Vec<&str> {
        self.history_param(&[
            "custom_ResourceLink.id.history",
            "resource_link_id_history",
            "ext_d2l_resource_link_id_history",
        ])
    }

    fn history_param(&self, keys: &[&str]) -> Vec<&str> {
        for key in keys {
            if let Some(value) = self.get(key) {
                let ids: Vec<&str> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                if !ids.is_empty() {
                    return ids;
                }
            }
        }
        Vec::new()
    }
}

/// Prefer bare role names and context-level `membership` URIs over
/// institution/system roles when both are present.
fn filter_roles(raw: &[String]) -> Vec<String> {
    let contextual: Vec<String> = raw
        .iter()
        .filter(|r| {
            r.starts_with(MEMBERSHIP_ROLE_PREFIX)
                || !(r.starts_with("http") || r.starts_with("urn"))
        })
        .cloned()
        .collect();
    if contextual.is_empty() {
        raw.to_vec()
    } else {
        contextual
    }
}

/// Total stringification: scalars render to their obvious string form,
/// structures to compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_claim(claims: &Value, key: &str) -> Option<String> {
    claims.get(key).and_then(Value::as_str).map(str::to_string)
}

fn insert_opt(params: &mut HashMap<String, String>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        params.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_jwt() -> Value {
        json!({
            "sub": "new-sub",
            "given_name": "Ada",
            "family_name": "Lovelace",
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            CLAIM_MESSAGE_TYPE: "LtiResourceLinkRequest",
            CLAIM_VERSION: "1.3.0",
            CLAIM_ROLES: [
                "http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor",
                "http://purl.imsglobal.org/vocab/lis/v2/institution/person#Staff",
            ],
            CLAIM_CONTEXT: { "id": "ctx-13", "title": "Course 13" },
            CLAIM_RESOURCE_LINK: {
                "id": "rl-13",
                "title": "Week 1 reading",
                "description": "Annotate chapter 1",
            },
            CLAIM_TOOL_PLATFORM: {
                "guid": "guid-13",
                "product_family_code": "canvas",
            },
            CLAIM_AGS_ENDPOINT: {
                "lineitem": "https://lms/api/lti/courses/1/line_items/9",
            },
            CLAIM_NRPS: {
                "context_memberships_url": "https://lms/api/lti/courses/1/names_and_roles",
            },
            CLAIM_DEEP_LINKING: {
                "deep_link_return_url": "https://lms/deep_linking_response",
            },
            CLAIM_CUSTOM: {
                "canvas_course_id": 319,
                "certification_guid": "fallback-guid",
            },
        })
    }

    #[test]
    fn jwt_mapping_matches_direct_claim_lookup() {
        let claims = sample_jwt();
        let payload = LaunchPayload::from_jwt_claims(claims.clone());

        assert_eq!(payload.user_id(), Some("new-sub"));
        assert_eq!(payload.get("lis_person_name_given"), Some("Ada"));
        assert_eq!(payload.get("lis_person_name_family"), Some("Lovelace"));
        assert_eq!(payload.get("lis_person_name_full"), Some("Ada Lovelace"));
        assert_eq!(
            payload.get("lis_person_contact_email_primary"),
            Some("ada@example.com")
        );
        assert_eq!(payload.context_id(), Some("ctx-13"));
        assert_eq!(payload.context_title(), Some("Course 13"));
        assert_eq!(payload.resource_link_id(), Some("rl-13"));
        assert_eq!(payload.resource_link_title(), Some("Week 1 reading"));
        assert_eq!(
            payload.resource_link_description(),
            Some("Annotate chapter 1")
        );
        assert_eq!(payload.tool_consumer_instance_guid(), Some("guid-13"));
        assert_eq!(payload.product_family_code(), Some("canvas"));
        assert_eq!(
            payload.lis_outcome_service_url(),
            Some("https://lms/api/lti/courses/1/line_items/9")
        );
        assert_eq!(
            payload.context_memberships_url(),
            Some("https://lms/api/lti/courses/1/names_and_roles")
        );
        assert_eq!(
            payload.deep_link_return_url(),
            Some("https://lms/deep_linking_response")
        );
        assert_eq!(payload.message_type(), Some("LtiResourceLinkRequest"));
        assert_eq!(payload.lti_version(), Some("1.3.0"));
        assert_eq!(payload.jwt_claims(), Some(&claims));
    }

    #[test]
    fn lti1p1_migration_claim_wins_for_identity_fields() {
        let mut claims = sample_jwt();
        claims[CLAIM_LTI1P1] = json!({
            "user_id": "legacy-user",
            "context_id": "legacy-ctx",
            "resource_link_id": "legacy-rl",
        });
        let payload = LaunchPayload::from_jwt_claims(claims);

        assert_eq!(payload.user_id(), Some("legacy-user"));
        assert_eq!(payload.context_id(), Some("legacy-ctx"));
        assert_eq!(payload.resource_link_id(), Some("legacy-rl"));
        // Non-identity context fields still come from the 1.3 claims.
        assert_eq!(payload.context_title(), Some("Course 13"));
    }

    #[test]
    fn membership_roles_are_preferred_over_institution_roles() {
        let payload = LaunchPayload::from_jwt_claims(sample_jwt());
        assert_eq!(
            payload.roles(),
            vec!["http://purl.imsglobal.org/vocab/lis/v2/membership#Instructor"]
        );
    }

    #[test]
    fn institution_roles_survive_when_nothing_contextual_exists() {
        let mut claims = sample_jwt();
        claims[CLAIM_ROLES] =
            json!(["http://purl.imsglobal.org/vocab/lis/v2/institution/person#Staff"]);
        let payload = LaunchPayload::from_jwt_claims(claims);
        assert_eq!(
            payload.roles(),
            vec!["http://purl.imsglobal.org/vocab/lis/v2/institution/person#Staff"]
        );
    }

    #[test]
    fn integer_custom_params_are_coerced_to_strings() {
        let payload = LaunchPayload::from_jwt_claims(sample_jwt());
        assert_eq!(payload.custom("canvas_course_id"), Some("319"));
    }

    #[test]
    fn custom_certification_guid_backfills_a_missing_platform_guid() {
        let mut claims = sample_jwt();
        claims[CLAIM_TOOL_PLATFORM] = json!({ "product_family_code": "canvas" });
        let payload = LaunchPayload::from_jwt_claims(claims);
        assert_eq!(
            payload.tool_consumer_instance_guid(),
            Some("fallback-guid")
        );
    }

    #[test]
    fn form_params_pass_through_verbatim() {
        let mut params = HashMap::new();
        params.insert("user_id".to_string(), "u1".to_string());
        params.insert("roles".to_string(), "Instructor,Learner".to_string());
        params.insert("custom_group_set_id".to_string(), "7".to_string());
        let payload = LaunchPayload::from_form_params(params);

        assert_eq!(payload.version(), LtiVersion::V11);
        assert_eq!(payload.user_id(), Some("u1"));
        assert_eq!(payload.roles(), vec!["Instructor", "Learner"]);
        assert_eq!(payload.custom("group_set_id"), Some("7"));
        assert!(payload.jwt_claims().is_none());
    }

    #[test]
    fn require_reports_the_missing_key() {
        let payload = LaunchPayload::from_form_params(HashMap::new());
        match payload.require("resource_link_id") {
            Err(ServiceError::MissingRequiredClaim(name)) => {
                assert_eq!(name, "resource_link_id")
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn history_params_split_on_commas_newest_first() {
        let mut params = HashMap::new();
        params.insert(
            "custom_Context.id.history".to_string(),
            "ctx-new, ctx-mid ,ctx-old".to_string(),
        );
        let payload = LaunchPayload::from_form_params(params);
        assert_eq!(
            payload.context_id_history(),
            vec!["ctx-new", "ctx-mid", "ctx-old"]
        );
        assert!(payload.resource_link_id_history().is_empty());
    }
}
