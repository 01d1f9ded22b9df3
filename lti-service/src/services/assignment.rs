//! Assignment resolution and upsert.
//!
//! An assignment is keyed by `(tool_consumer_instance_guid, resource_link_id)`.
//! A launch may reference one directly, via copy-history claims after a course
//! copy, or carry a fresh deep-linked document URL. SpeedGrader launches are
//! read-only here.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::models::{Assignment, Grouping, Tenant};
use crate::services::database::Database;
use crate::services::error::ServiceError;
use crate::services::payload::LaunchPayload;
use crate::services::plugin::ProductPlugin;

/// Canvas double-encodes deep-linked URLs: a scheme followed by `%3a` means
/// one layer of encoding is still on.
static DOUBLE_ENCODED_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z][a-z0-9+.-]*%3a").unwrap());

/// Unquote a deep-linked URL once when it is still percent-encoded.
pub fn normalize_document_url(url: &str) -> String {
    if DOUBLE_ENCODED_SCHEME.is_match(url) {
        if let Ok(decoded) = urlencoding::decode(url) {
            return decoded.into_owned();
        }
    }
    url.to_string()
}

#[derive(Clone)]
pub struct AssignmentService {
    db: Database,
}

impl AssignmentService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve (creating or updating) the assignment for a launch.
    ///
    /// Returns `NoDocumentUrl` when neither an existing row, a copied
    /// original, nor the launch itself can supply a document URL; the caller
    /// routes such launches to the content chooser.
    pub async fn get_for_launch(
        &self,
        tenant: &Tenant,
        guid: &str,
        payload: &LaunchPayload,
        plugin: &dyn ProductPlugin,
        course: Option<&Grouping>,
    ) -> Result<Assignment, ServiceError> {
        let resource_link_id = payload.require("resource_link_id")?;
        let is_speedgrader = plugin.is_speedgrader(payload);

        let existing = self.db.find_assignment(guid, resource_link_id).await?;

        // A course copy shows up as a miss on the new resource_link_id with
        // the old one in a history claim.
        let historical = match &existing {
            Some(_) => None,
            None => {
                self.db
                    .find_assignment_by_history(guid, &payload.resource_link_id_history())
                    .await?
            }
        };

        let launch_document_url = payload
            .custom("url")
            .or_else(|| payload.get("url"))
            .map(normalize_document_url);
        let deep_linking_uuid = payload.custom("deep_linking_uuid").map(str::to_string);

        // Configuration precedence: the row itself, then the copied original,
        // then what this launch carries.
        let document_url = existing
            .as_ref()
            .and_then(|a| a.document_url.clone())
            .or_else(|| historical.as_ref().and_then(|a| a.document_url.clone()))
            .or(launch_document_url);
        let Some(document_url) = document_url else {
            debug!(resource_link_id, "launch has no resolvable document URL");
            return Err(ServiceError::NoDocumentUrl);
        };

        let assignment = match existing {
            Some(assignment) => assignment,
            None => {
                let copied_from_id = historical.as_ref().map(|a| a.id);
                if let Some(original) = &historical {
                    info!(
                        resource_link_id,
                        copied_from = original.id,
                        "linking copied assignment"
                    );
                }
                self.db
                    .insert_assignment(
                        tenant.id,
                        guid,
                        resource_link_id,
                        Some(&document_url),
                        copied_from_id,
                        deep_linking_uuid.as_deref(),
                    )
                    .await?
            }
        };

        if is_speedgrader {
            // Canvas sends the referencing assignment's metadata in grader
            // launches; nothing persistent may be rewritten from it.
            return Ok(assignment);
        }

        let group_set_id = payload
            .custom("group_set")
            .or_else(|| payload.custom("group_set_id"))
            .map(str::to_string);
        let is_gradable = payload.lis_outcome_service_url().is_some()
            || payload.custom("canvas_assignment_id").is_some();

        self.db
            .update_assignment_from_launch(
                assignment.id,
                Some(&document_url),
                payload.resource_link_title(),
                payload.resource_link_description(),
                is_gradable,
                course.map(|c| c.id),
                group_set_id.as_deref(),
            )
            .await
    }
}
