//! LTI role parsing and the role catalogue.
//!
//! `parse_role` is total: any non-empty string yields a `(scope, kind)`,
//! defaulting to `(COURSE, LEARNER)` when nothing matches. The catalogue
//! keeps one row per distinct raw value; tenant overrides are applied on
//! fetch and never written back to the canonical rows.

use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;

use crate::models::{LtiRole, RoleKind, RoleScope, Tenant};
use crate::services::database::Database;
use crate::services::error::ServiceError;

// Ordered patterns; first match wins.
static V11_SCOPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^urn:lti:(instrole|role|sysrole):ims/lis/(\w+)").unwrap()
});
static V13_SIMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^http://purl\.imsglobal\.org/vocab/lis/v2/(membership|system|institution)#(\w+)$")
        .unwrap()
});
static V13_SUB_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^http://purl\.imsglobal\.org/vocab/lis/v2/(membership|system|institution)/(\w+)#(\w+)$",
    )
    .unwrap()
});
static V13_LTI_SYSTEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^http://purl\.imsglobal\.org/vocab/lti/(system)/(\w+)#(\w+)$").unwrap()
});

/// Parse a raw role string into its scope and privilege kind.
pub fn parse_role(value: &str) -> (RoleScope, RoleKind) {
    if let Some(caps) = V11_SCOPED.captures(value) {
        let scope = match &caps[1] {
            "role" => RoleScope::Course,
            "instrole" => RoleScope::Institution,
            _ => RoleScope::System,
        };
        return (scope, kind_for(&caps[2]));
    }

    if let Some(caps) = V13_SIMPLE.captures(value) {
        return (scope_for(&caps[1]), kind_for(&caps[2]));
    }

    if let Some(caps) = V13_SUB_ROLE.captures(value) {
        let main = &caps[2];
        let sub = &caps[3];
        // `person` carries no privilege itself; the sub-type is promoted.
        let kind = if main.eq_ignore_ascii_case("person") {
            kind_for(sub)
        } else {
            kind_for(main)
        };
        return (scope_for(&caps[1]), kind);
    }

    if let Some(caps) = V13_LTI_SYSTEM.captures(value) {
        return (RoleScope::System, kind_for(&caps[2]));
    }

    // Deprecated bare names ("Instructor", "urn:..." already handled above).
    if !value.starts_with("http") && !value.starts_with("urn") {
        return (RoleScope::Course, kind_for(value));
    }

    (RoleScope::Course, RoleKind::Learner)
}

fn scope_for(segment: &str) -> RoleScope {
    match segment {
        "membership" => RoleScope::Course,
        "institution" => RoleScope::Institution,
        "system" => RoleScope::System,
        _ => RoleScope::Course,
    }
}

fn kind_for(name: &str) -> RoleKind {
    match name.to_ascii_lowercase().as_str() {
        "administrator" | "sysadmin" | "sysadministrator" | "accountadmin" | "syssupport"
        | "support" => RoleKind::Admin,
        "instructor" | "faculty" | "staff" | "mentor" | "teachingassistant"
        | "contentdeveloper" | "grader" | "teacher" => RoleKind::Instructor,
        _ => RoleKind::Learner,
    }
}

/// Catalogue service: role rows behind an in-process cache, with per-tenant
/// overrides applied at lookup.
#[derive(Clone)]
pub struct RoleService {
    db: Database,
    cache: std::sync::Arc<DashMap<String, LtiRole>>,
}

impl RoleService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Look up (inserting when missing) the role rows for a launch's raw role
    /// strings, with this tenant's overrides applied to the returned copies.
    pub async fn get_roles(
        &self,
        tenant: &Tenant,
        values: &[&str],
    ) -> Result<Vec<LtiRole>, ServiceError> {
        let mut distinct: Vec<&str> = Vec::new();
        for value in values {
            let trimmed = value.trim();
            if !trimmed.is_empty() && !distinct.contains(&trimmed) {
                distinct.push(trimmed);
            }
        }

        let mut roles = Vec::with_capacity(distinct.len());
        for value in distinct {
            let role = match self.cache.get(value) {
                Some(cached) => cached.clone(),
                None => {
                    let role = self.load_or_insert(value).await?;
                    self.cache.insert(value.to_string(), role.clone());
                    role
                }
            };
            roles.push(role);
        }

        self.apply_overrides(tenant, &mut roles).await?;
        Ok(roles)
    }

    async fn load_or_insert(&self, value: &str) -> Result<LtiRole, ServiceError> {
        if let Some(role) = self.db.find_role_by_value(value).await? {
            return Ok(role);
        }
        let (scope, kind) = parse_role(value);
        self.db.insert_role(value, scope, kind).await
    }

    /// Overrides replace (scope, kind) in the returned copies only; the
    /// canonical catalogue rows are never mutated by override data.
    async fn apply_overrides(
        &self,
        tenant: &Tenant,
        roles: &mut [LtiRole],
    ) -> Result<(), ServiceError> {
        let overrides = self.db.find_role_overrides(tenant.id).await?;
        if overrides.is_empty() {
            return Ok(());
        }
        for role in roles.iter_mut() {
            if let Some((scope, kind)) = overrides.get(&role.value) {
                role.scope = scope.as_str().to_string();
                role.kind = kind.as_str().to_string();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v11_scoped_urns() {
        assert_eq!(
            parse_role("urn:lti:role:ims/lis/Instructor"),
            (RoleScope::Course, RoleKind::Instructor)
        );
        assert_eq!(
            parse_role("urn:lti:instrole:ims/lis/Administrator"),
            (RoleScope::Institution, RoleKind::Admin)
        );
        assert_eq!(
            parse_role("urn:lti:sysrole:ims/lis/SysAdmin"),
            (RoleScope::System, RoleKind::Admin)
        );
    }

    #[test]
    fn v13_simple_subtype_uris() {
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lis/v2/membership#Learner"),
            (RoleScope::Course, RoleKind::Learner)
        );
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lis/v2/institution#Staff"),
            (RoleScope::Institution, RoleKind::Instructor)
        );
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lis/v2/system#SysAdmin"),
            (RoleScope::System, RoleKind::Admin)
        );
    }

    #[test]
    fn v13_sub_roles_promote_person_subtype() {
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lis/v2/institution/person#Student"),
            (RoleScope::Institution, RoleKind::Learner)
        );
        // person promotes the sub-type...
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lis/v2/institution/person#Instructor"),
            (RoleScope::Institution, RoleKind::Instructor)
        );
        // ...but a privileged main type keeps its own kind.
        assert_eq!(
            parse_role(
                "http://purl.imsglobal.org/vocab/lis/v2/membership/Instructor#TeachingAssistant"
            ),
            (RoleScope::Course, RoleKind::Instructor)
        );
    }

    #[test]
    fn v13_lti_system_roles() {
        assert_eq!(
            parse_role("http://purl.imsglobal.org/vocab/lti/system/person#TestUser"),
            (RoleScope::System, RoleKind::Learner)
        );
    }

    #[test]
    fn bare_names_default_to_course_scope() {
        assert_eq!(
            parse_role("Instructor"),
            (RoleScope::Course, RoleKind::Instructor)
        );
        assert_eq!(parse_role("Student"), (RoleScope::Course, RoleKind::Learner));
        assert_eq!(
            parse_role("TeachingAssistant"),
            (RoleScope::Course, RoleKind::Instructor)
        );
    }

    #[test]
    fn parsing_is_total() {
        for garbage in [
            "??",
            "http://example.com/made/up#Role",
            "urn:something:else",
            "urn:lti:role:ims/lis/FutureRole",
        ] {
            let (scope, kind) = parse_role(garbage);
            // Unknown kinds land on LEARNER; scope keeps whatever matched.
            assert!(matches!(
                scope,
                RoleScope::Course | RoleScope::Institution | RoleScope::System
            ));
            if garbage.contains("FutureRole") || !garbage.starts_with("urn:lti") {
                assert_eq!(kind, RoleKind::Learner, "for {garbage}");
            }
        }
        assert_eq!(parse_role("??"), (RoleScope::Course, RoleKind::Learner));
    }
}
