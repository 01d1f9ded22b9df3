//! Grade submission.
//!
//! LTI 1.1 grades travel as LIS Outcomes 1.0 `replaceResult` POX envelopes
//! signed with OAuth 1.0a over the XML body; LTI 1.3 grades as AGS Score
//! JSON posted to the lineitem's `/scores` endpoint with an Advantage bearer.

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::models::Tenant;
use crate::services::advantage::{AGS_SCORE_SCOPE, AdvantageService};
use crate::services::error::ServiceError;
use crate::services::oauth1;
use crate::services::payload::LtiVersion;
use crate::services::plugin::ProductPlugin;

const SCORE_CONTENT_TYPE: &str = "application/vnd.ims.lis.v1.score+json";

/// One grade to submit.
#[derive(Debug, Clone)]
pub struct GradeSubmission {
    /// Fraction in `0.0..=1.0`.
    pub score: f64,
    /// The graded user's platform id (1.3) or result sourcedid (1.1).
    pub user_id: String,
    /// Optional launch URL submitted as the 1.1 result payload.
    pub launch_url: Option<String>,
    pub comment: Option<String>,
}

/// Build the `replaceResult` POX envelope.
fn pox_replace_result(sourcedid: &str, score: f64, launch_url: Option<&str>) -> String {
    let result_data = match launch_url {
        Some(url) => format!(
            "<resultData><ltiLaunchUrl>{}</ltiLaunchUrl></resultData>",
            xml_escape(url)
        ),
        None => String::new(),
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<imsx_POXEnvelopeRequest xmlns="http://www.imsglobal.org/services/ltiv1p1/xsd/imsoms_v1p0">
  <imsx_POXHeader>
    <imsx_POXRequestHeaderInfo>
      <imsx_version>V1.0</imsx_version>
      <imsx_messageIdentifier>{message_id}</imsx_messageIdentifier>
    </imsx_POXRequestHeaderInfo>
  </imsx_POXHeader>
  <imsx_POXBody>
    <replaceResultRequest>
      <resultRecord>
        <sourcedGUID><sourcedId>{sourcedid}</sourcedId></sourcedGUID>
        <result><resultScore><language>en</language><textString>{score}</textString></resultScore>{result_data}</result>
      </resultRecord>
    </replaceResultRequest>
  </imsx_POXBody>
</imsx_POXEnvelopeRequest>"#,
        message_id = Uuid::new_v4(),
        sourcedid = xml_escape(sourcedid),
        score = score,
        result_data = result_data,
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the AGS Score document.
fn ags_score(submission: &GradeSubmission, comment: Option<&str>) -> Value {
    let mut score = json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "scoreGiven": submission.score,
        "scoreMaximum": 1.0,
        "activityProgress": "Completed",
        "gradingProgress": "FullyGraded",
        "userId": submission.user_id,
    });
    if let Some(comment) = comment {
        score["comment"] = json!(comment);
    }
    score
}

/// Append `/scores` to a lineitem URL, keeping any query string intact.
fn scores_url(lineitem: &str) -> String {
    match lineitem.split_once('?') {
        Some((base, query)) => format!("{}/scores?{}", base, query),
        None => format!("{}/scores", lineitem),
    }
}

#[derive(Clone)]
pub struct GradingService {
    http_client: reqwest::Client,
    advantage: AdvantageService,
}

impl GradingService {
    pub fn new(http_client: reqwest::Client, advantage: AdvantageService) -> Self {
        Self {
            http_client,
            advantage,
        }
    }

    /// Submit a 1.1 grade to the launch's outcome service URL.
    /// Not retried; outcomes POSTs are not idempotent on every LMS.
    pub async fn submit_outcome_11(
        &self,
        tenant: &Tenant,
        outcome_service_url: &str,
        submission: &GradeSubmission,
    ) -> Result<(), ServiceError> {
        let consumer_key = tenant
            .consumer_key
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;
        let shared_secret = tenant
            .shared_secret
            .as_deref()
            .ok_or(ServiceError::UnknownTenant)?;

        let body = pox_replace_result(
            &submission.user_id,
            submission.score,
            submission.launch_url.as_deref(),
        );
        let authorization = oauth1::authorization_header(
            "POST",
            outcome_service_url,
            consumer_key,
            shared_secret,
            &body,
        );

        let response = self
            .http_client
            .post(outcome_service_url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
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
        info!(tenant_id = tenant.id, "submitted LIS outcome");
        Ok(())
    }

    /// Submit a 1.3 grade to the lineitem's `/scores` endpoint.
    pub async fn submit_score_13(
        &self,
        tenant: &Tenant,
        lineitem_url: &str,
        submission: &GradeSubmission,
        plugin: &dyn ProductPlugin,
    ) -> Result<(), ServiceError> {
        // Comments only exist on the 1.3 wire; the plugin renders them.
        let comment = submission
            .comment
            .as_deref()
            .filter(|_| plugin.accepts_comments(LtiVersion::V13))
            .map(|c| plugin.format_comment(c));

        let score = ags_score(submission, comment.as_deref());
        self.advantage
            .post_json(
                tenant,
                &scores_url(lineitem_url),
                &[AGS_SCORE_SCOPE],
                SCORE_CONTENT_TYPE,
                &score,
            )
            .await?;
        info!(tenant_id = tenant.id, "submitted AGS score");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::plugin::{BlackboardPlugin, CanvasPlugin};

    fn submission(comment: Option<&str>) -> GradeSubmission {
        GradeSubmission {
            score: 0.85,
            user_id: "sourcedid-1".to_string(),
            launch_url: Some("https://tool/launch?a=1&b=2".to_string()),
            comment: comment.map(str::to_string),
        }
    }

    #[test]
    fn pox_envelope_carries_sourcedid_score_and_url() {
        let xml = pox_replace_result("sid<1>", 0.85, Some("https://tool/launch?a=1&b=2"));
        assert!(xml.contains("<replaceResultRequest>"));
        assert!(xml.contains("<sourcedId>sid&lt;1&gt;</sourcedId>"));
        assert!(xml.contains("<textString>0.85</textString>"));
        assert!(xml.contains("<ltiLaunchUrl>https://tool/launch?a=1&amp;b=2</ltiLaunchUrl>"));
    }

    #[test]
    fn pox_envelope_omits_result_data_without_url() {
        let xml = pox_replace_result("sid", 1.0, None);
        assert!(!xml.contains("resultData"));
    }

    #[test]
    fn ags_score_shape() {
        let score = ags_score(&submission(None), Some("good work"));
        assert_eq!(score["scoreGiven"], 0.85);
        assert_eq!(score["scoreMaximum"], 1.0);
        assert_eq!(score["activityProgress"], "Completed");
        assert_eq!(score["gradingProgress"], "FullyGraded");
        assert_eq!(score["userId"], "sourcedid-1");
        assert_eq!(score["comment"], "good work");

        let without = ags_score(&submission(None), None);
        assert!(without.get("comment").is_none());
    }

    #[test]
    fn comments_render_through_the_product_plugin() {
        let comment = "Line one\nLine <b>two</b>";
        assert_eq!(
            CanvasPlugin.format_comment(comment),
            "Line one\nLine two"
        );
        assert_eq!(
            BlackboardPlugin.format_comment(comment),
            "Line one<br/>Line two"
        );
    }

    #[test]
    fn scores_url_preserves_query_string() {
        assert_eq!(
            scores_url("https://lms/api/lineitems/7"),
            "https://lms/api/lineitems/7/scores"
        );
        assert_eq!(
            scores_url("https://lms/api/lineitems/7?type=external"),
            "https://lms/api/lineitems/7/scores?type=external"
        );
    }
}
