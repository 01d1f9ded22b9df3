//! Per-product behavior.
//!
//! Each LMS family gets a `ProductPlugin` implementation; a registry keyed by
//! `tool_consumer_info_product_family_code` dispatches to it. Unknown
//! products fall back to the default behavior.

use crate::services::payload::{LaunchPayload, LtiVersion};

/// Canvas SpeedGrader launches carry this custom parameter; its presence is
/// the sentinel that the launch metadata describes the wrong assignment.
const SPEEDGRADER_SENTINEL: &str = "learner_canvas_user_id";

/// Capability interface for one LMS product family.
pub trait ProductPlugin: Send + Sync {
    fn family_code(&self) -> &'static str;

    /// Whether this launch is a grader-side launch whose payload must not be
    /// trusted for assignment metadata.
    fn is_speedgrader(&self, _payload: &LaunchPayload) -> bool {
        false
    }

    /// The LMS user id of the student being graded, for grader launches.
    fn grading_user_id(&self, _payload: &LaunchPayload) -> Option<String> {
        None
    }

    /// Grade comments are only representable over LTI 1.3.
    fn accepts_comments(&self, version: LtiVersion) -> bool {
        version == LtiVersion::V13
    }

    /// Render a comment for submission to this LMS. HTML is stripped on the
    /// way in regardless of product.
    fn format_comment(&self, comment: &str) -> String {
        strip_html(comment)
    }

    /// The URL the LMS should store from a deep-linking response.
    fn deep_linking_launch_url(&self, tool_launch_url: &str, document_url: &str) -> String {
        format!(
            "{}?url={}",
            tool_launch_url,
            urlencoding::encode(document_url)
        )
    }

    /// Post-mapping payload adjustments. `query_resource_link_id` is the
    /// value from the launch URL's query string, when the caller has one.
    fn apply_quirks(&self, _payload: &mut LaunchPayload, _query_resource_link_id: Option<&str>) {}
}

/// Default behavior for products without quirks.
pub struct DefaultPlugin;

impl ProductPlugin for DefaultPlugin {
    fn family_code(&self) -> &'static str {
        "default"
    }
}

pub struct CanvasPlugin;

impl ProductPlugin for CanvasPlugin {
    fn family_code(&self) -> &'static str {
        "canvas"
    }

    fn is_speedgrader(&self, payload: &LaunchPayload) -> bool {
        payload.custom(SPEEDGRADER_SENTINEL).is_some()
    }

    fn grading_user_id(&self, payload: &LaunchPayload) -> Option<String> {
        payload.custom(SPEEDGRADER_SENTINEL).map(str::to_string)
    }

    fn apply_quirks(&self, payload: &mut LaunchPayload, query_resource_link_id: Option<&str>) {
        // SpeedGrader posts the referencing assignment's resource_link_id in
        // the body; the query string carries the right one.
        if self.is_speedgrader(payload) {
            if let Some(rlid) = query_resource_link_id {
                payload.set("resource_link_id", rlid.to_string());
            }
        }
    }
}

pub struct BlackboardPlugin;

impl ProductPlugin for BlackboardPlugin {
    fn family_code(&self) -> &'static str {
        "blackboard"
    }

    fn format_comment(&self, comment: &str) -> String {
        // Blackboard renders plain text; newlines survive only as markup.
        strip_html(comment).replace('\n', "<br/>")
    }
}

pub struct MoodlePlugin;

impl ProductPlugin for MoodlePlugin {
    fn family_code(&self) -> &'static str {
        "moodle"
    }
}

pub struct D2lPlugin;

impl ProductPlugin for D2lPlugin {
    fn family_code(&self) -> &'static str {
        "desire2learn"
    }
}

/// Registry of product plugins keyed by family code.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn ProductPlugin>>,
    fallback: DefaultPlugin,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: vec![
                Box::new(CanvasPlugin),
                Box::new(BlackboardPlugin),
                Box::new(MoodlePlugin),
                Box::new(D2lPlugin),
            ],
            fallback: DefaultPlugin,
        }
    }

    pub fn get(&self, family_code: Option<&str>) -> &dyn ProductPlugin {
        family_code
            .and_then(|code| {
                self.plugins
                    .iter()
                    .find(|p| p.family_code() == code)
                    .map(Box::as_ref)
            })
            .unwrap_or(&self.fallback)
    }

    /// Resolve the plugin for a payload from its product family code.
    pub fn for_payload(&self, payload: &LaunchPayload) -> &dyn ProductPlugin {
        self.get(payload.product_family_code())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove HTML tags, decoding nothing: comments are treated as plain text.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn canvas_payload(speedgrader: bool) -> LaunchPayload {
        let mut params = HashMap::new();
        params.insert(
            "tool_consumer_info_product_family_code".to_string(),
            "canvas".to_string(),
        );
        params.insert("resource_link_id".to_string(), "wrong".to_string());
        if speedgrader {
            params.insert(
                "custom_learner_canvas_user_id".to_string(),
                "941".to_string(),
            );
        }
        LaunchPayload::from_form_params(params)
    }

    #[test]
    fn registry_dispatches_on_family_code_with_default_fallback() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.get(Some("canvas")).family_code(), "canvas");
        assert_eq!(registry.get(Some("moodle")).family_code(), "moodle");
        assert_eq!(registry.get(Some("sakai")).family_code(), "default");
        assert_eq!(registry.get(None).family_code(), "default");
    }

    #[test]
    fn speedgrader_detected_by_sentinel_param() {
        let registry = PluginRegistry::new();
        let plugin = registry.for_payload(&canvas_payload(true));
        assert!(plugin.is_speedgrader(&canvas_payload(true)));
        assert!(!plugin.is_speedgrader(&canvas_payload(false)));
        assert_eq!(
            plugin.grading_user_id(&canvas_payload(true)),
            Some("941".to_string())
        );
    }

    #[test]
    fn speedgrader_quirk_takes_resource_link_id_from_query() {
        let registry = PluginRegistry::new();
        let mut payload = canvas_payload(true);
        registry
            .for_payload(&payload.clone())
            .apply_quirks(&mut payload, Some("rl-correct"));
        assert_eq!(payload.resource_link_id(), Some("rl-correct"));
    }

    #[test]
    fn non_speedgrader_launch_keeps_body_resource_link_id() {
        let registry = PluginRegistry::new();
        let mut payload = canvas_payload(false);
        registry
            .for_payload(&payload.clone())
            .apply_quirks(&mut payload, Some("rl-correct"));
        assert_eq!(payload.resource_link_id(), Some("wrong"));
    }

    #[test]
    fn comments_only_accepted_for_lti_13() {
        let plugin = CanvasPlugin;
        assert!(plugin.accepts_comments(LtiVersion::V13));
        assert!(!plugin.accepts_comments(LtiVersion::V11));
    }

    #[test]
    fn blackboard_converts_newlines_to_br() {
        let plugin = BlackboardPlugin;
        assert_eq!(
            plugin.format_comment("<b>Nice</b> work\nkeep going"),
            "Nice work<br/>keep going"
        );
    }

    #[test]
    fn strip_html_removes_tags_only() {
        assert_eq!(strip_html("<p>hi <em>there</em></p>"), "hi there");
        assert_eq!(strip_html("plain"), "plain");
    }
}
