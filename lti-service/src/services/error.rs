use service_core::error::AppError;
use thiserror::Error;

/// Error kinds surfaced by the launch and identity pipeline.
///
/// Verification failures are fatal for the current request and commit no
/// writes. `NoDocumentUrl` and the OAuth2 variants are recoverable: callers
/// route to the deep-linking chooser or the LMS authorize endpoint.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("OAuth 1.0 signature does not match")]
    BadSignature,

    #[error("OAuth 1.0 timestamp outside the accepted window")]
    StaleTimestamp,

    #[error("Nonce has already been used")]
    ReplayedNonce,

    #[error("Launch JWT has expired")]
    ExpiredJwt,

    #[error("Launch JWT is invalid: {0}")]
    InvalidJwt(String),

    #[error("No tenant registered for these launch credentials")]
    UnknownTenant,

    #[error("tool_consumer_instance_guid does not match this installation")]
    ReusedGuid,

    #[error("Unsupported lti_version: {0}")]
    UnsupportedLtiVersion(String),

    #[error("Missing required claim: {0}")]
    MissingRequiredClaim(String),

    #[error("Launch has no resolvable document URL")]
    NoDocumentUrl,

    #[error("User must authorize API access with the LMS")]
    OAuth2NeedsAuthorization,

    #[error("OAuth 2.0 token refresh was rejected by the LMS")]
    OAuth2RefreshFailed,

    #[error("LMS API returned {status}: {body}")]
    ExternalApi { status: u16, body: String },

    #[error("Course has no roster (NRPS) endpoint")]
    NoRosterEndpoint,

    #[error("Roster fetch failed: {0}")]
    RosterFetchFailed(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::anyhow!(e)),
            ServiceError::Http(e) => AppError::BadGateway(e.to_string()),
            ServiceError::Internal(e) => AppError::InternalError(e),
            err @ (ServiceError::BadSignature
            | ServiceError::StaleTimestamp
            | ServiceError::ReplayedNonce
            | ServiceError::ExpiredJwt
            | ServiceError::InvalidJwt(_)
            | ServiceError::UnknownTenant
            | ServiceError::ReusedGuid) => AppError::AuthError(anyhow::anyhow!(err.to_string())),
            err @ (ServiceError::UnsupportedLtiVersion(_)
            | ServiceError::MissingRequiredClaim(_)) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            err @ ServiceError::NoDocumentUrl => {
                AppError::NotFound(anyhow::anyhow!(err.to_string()))
            }
            err @ (ServiceError::OAuth2NeedsAuthorization
            | ServiceError::OAuth2RefreshFailed) => {
                AppError::Unauthorized(anyhow::anyhow!(err.to_string()))
            }
            ServiceError::ExternalApi { status, body } => {
                AppError::BadGateway(format!("upstream {}: {}", status, body))
            }
            err @ (ServiceError::NoRosterEndpoint | ServiceError::RosterFetchFailed(_)) => {
                AppError::BadGateway(err.to_string())
            }
        }
    }
}
