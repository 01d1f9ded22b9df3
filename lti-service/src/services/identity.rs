//! Stable identity derivation.
//!
//! Pure, deterministic functions mapping launch claims to tenant-scoped
//! identifiers. Every input is coerced through `&str`, so the output only
//! changes when the semantic input changes.

use sha1::{Digest, Sha1};
use unicode_segmentation::UnicodeSegmentation;

/// Placeholder when no name material is available at all.
const FALLBACK_DISPLAY_NAME: &str = "Student";

/// Lowercase hex SHA-1 over the concatenation of `parts`.
pub fn sha1_hex(parts: &[&str]) -> String {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Stable user identifier: `acct:<first 30 hex of sha1(guid || lti_user_id)>@<authority>`.
pub fn h_userid(authority: &str, guid: &str, lti_user_id: &str) -> String {
    let digest = sha1_hex(&[guid, lti_user_id]);
    format!("acct:{}@{}", &digest[..30], authority)
}

/// Authority-provided id for a course: `sha1(guid || context_id)`.
pub fn course_authority_id(guid: &str, context_id: &str) -> String {
    sha1_hex(&[guid, context_id])
}

/// Authority-provided id for a section or group under `parent_lms_id`.
///
/// The kind tag is mixed in for groups; Canvas sections predate the tag and
/// keep the untagged form (`kind_tag = None`).
pub fn grouping_authority_id(
    guid: &str,
    parent_lms_id: &str,
    kind_tag: Option<&str>,
    lms_id: &str,
) -> String {
    match kind_tag {
        Some(tag) => sha1_hex(&[guid, parent_lms_id, tag, lms_id]),
        None => sha1_hex(&[guid, parent_lms_id, lms_id]),
    }
}

/// Resolve a display name from the available launch name fields.
///
/// Preference order: explicit full name, then `"given family"` (trimmed,
/// single-spaced), then email, then a placeholder. Names longer than
/// `max_graphemes` are cut on a grapheme boundary and suffixed with an
/// ellipsis so the result is exactly `max_graphemes` long.
pub fn display_name(
    full_name: Option<&str>,
    given_name: Option<&str>,
    family_name: Option<&str>,
    email: Option<&str>,
    max_graphemes: usize,
) -> String {
    let name = resolve_name(full_name, given_name, family_name, email);
    truncate_name(&name, max_graphemes)
}

fn resolve_name(
    full_name: Option<&str>,
    given_name: Option<&str>,
    family_name: Option<&str>,
    email: Option<&str>,
) -> String {
    if let Some(full) = non_blank(full_name) {
        return single_spaced(full);
    }

    let given = non_blank(given_name).unwrap_or("");
    let family = non_blank(family_name).unwrap_or("");
    let joined = single_spaced(&format!("{} {}", given, family));
    if !joined.is_empty() {
        return joined;
    }

    if let Some(email) = non_blank(email) {
        return email.trim().to_string();
    }

    FALLBACK_DISPLAY_NAME.to_string()
}

fn truncate_name(name: &str, max_graphemes: usize) -> String {
    let graphemes: Vec<&str> = name.graphemes(true).collect();
    if graphemes.len() <= max_graphemes {
        return name.to_string();
    }
    let mut truncated: String = graphemes[..max_graphemes.saturating_sub(1)].concat();
    truncated.push('…');
    truncated
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn single_spaced(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_userid_is_stable_and_30_hex_long() {
        let a = h_userid("lms.hypothes.is", "guid1", "u1");
        let b = h_userid("lms.hypothes.is", "guid1", "u1");
        assert_eq!(a, b);

        let hex_part = a
            .strip_prefix("acct:")
            .and_then(|s| s.strip_suffix("@lms.hypothes.is"))
            .unwrap();
        assert_eq!(hex_part.len(), 30);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn h_userid_matches_sha1_of_concatenation() {
        // sha1("guid1u1") computed independently.
        let digest = sha1_hex(&["guid1", "u1"]);
        let expected = format!("acct:{}@authority", &digest[..30]);
        assert_eq!(h_userid("authority", "guid1", "u1"), expected);
    }

    #[test]
    fn different_users_get_different_ids() {
        assert_ne!(
            h_userid("a", "guid1", "u1"),
            h_userid("a", "guid1", "u2")
        );
        // Tenant guid salts the hash.
        assert_ne!(
            h_userid("a", "guid1", "u1"),
            h_userid("a", "guid2", "u1")
        );
    }

    #[test]
    fn course_authority_id_is_sha1_of_guid_and_context() {
        assert_eq!(
            course_authority_id("guid1", "ctx1"),
            sha1_hex(&["guid1ctx1"])
        );
        assert_eq!(course_authority_id("guid1", "ctx1").len(), 40);
    }

    #[test]
    fn grouping_authority_id_mixes_in_kind_tag() {
        let tagged = grouping_authority_id("g", "course1", Some("canvas_group"), "grp1");
        let untagged = grouping_authority_id("g", "course1", None, "grp1");
        assert_ne!(tagged, untagged);
        assert_eq!(untagged, sha1_hex(&["g", "course1", "grp1"]));
    }

    #[test]
    fn display_name_prefers_full_name() {
        assert_eq!(
            display_name(Some("  Ada   Lovelace "), Some("X"), Some("Y"), None, 30),
            "Ada Lovelace"
        );
    }

    #[test]
    fn display_name_falls_back_through_given_family_and_email() {
        assert_eq!(
            display_name(None, Some(" Ada "), Some("Lovelace"), None, 30),
            "Ada Lovelace"
        );
        assert_eq!(
            display_name(None, Some("Ada"), None, None, 30),
            "Ada"
        );
        assert_eq!(
            display_name(None, None, None, Some("ada@example.com"), 30),
            "ada@example.com"
        );
        assert_eq!(display_name(None, None, None, None, 30), "Student");
    }

    #[test]
    fn name_exactly_at_limit_is_not_truncated() {
        let name = "a".repeat(30);
        assert_eq!(display_name(Some(&name), None, None, None, 30), name);
    }

    #[test]
    fn name_one_over_limit_is_truncated_with_ellipsis() {
        let name = "a".repeat(31);
        let result = display_name(Some(&name), None, None, None, 30);
        assert_eq!(result.graphemes(true).count(), 30);
        assert!(result.ends_with('…'));
        assert!(result.starts_with(&"a".repeat(29)));
    }

    #[test]
    fn truncation_respects_grapheme_boundaries() {
        // Family emoji is one grapheme built from several code points.
        let name = "👩‍👩‍👧‍👦".repeat(5);
        let result = display_name(Some(&name), None, None, None, 3);
        assert_eq!(result.graphemes(true).count(), 3);
        assert!(result.ends_with('…'));
    }
}
