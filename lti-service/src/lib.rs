pub mod config;
pub mod models;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use crate::config::LtiConfig;
use crate::services::{
    AdvantageService, AssignmentService, Database, GradingService, GroupingService, LaunchService,
    MembershipService, OAuth2Service, PluginRegistry, RoleService, RosterService, ServiceError,
    VerificationService,
};
use service_core::error::AppError;

/// Shared application state: every service, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: LtiConfig,
    pub db: Database,
    pub launches: LaunchService,
    pub oauth2: OAuth2Service,
    pub advantage: AdvantageService,
    pub rosters: RosterService,
    pub grading: GradingService,
}

impl AppState {
    /// The tool's published key set. Platforms fetch this to verify the
    /// client-credentials assertions we sign; retired keys stay listed so
    /// assertions signed before a rotation still verify.
    pub async fn published_jwks(&self) -> Result<serde_json::Value, AppError> {
        let keys = self.db.all_rsa_keys().await?;
        Ok(services::keys::jwks_document(&keys))
    }

    /// Retire the active signing key and install a fresh one. New assertions
    /// pick up the new key immediately.
    pub async fn rotate_signing_key(&self) -> Result<uuid::Uuid, AppError> {
        let key = services::keys::generate_key()?;
        self.db
            .rotate_rsa_key(key.kid, &key.public_jwk, &key.private_pem)
            .await?;
        tracing::info!(kid = %key.kid, "rotated RSA signing key");
        Ok(key.kid)
    }
}

/// Connect, migrate, and wire the service graph.
pub async fn build_state(config: LtiConfig) -> Result<AppState, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;

    let db = Database::new(pool);
    ensure_signing_key(&db).await?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http.timeout_seconds))
        .build()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    let verification = VerificationService::new(db.clone(), http_client.clone());
    let roles = RoleService::new(db.clone());
    let groupings = GroupingService::new(db.clone());
    let assignments = AssignmentService::new(db.clone());
    let memberships = MembershipService::new(db.clone());
    let plugins = Arc::new(PluginRegistry::new());
    let advantage = AdvantageService::new(db.clone(), http_client.clone());

    let launches = LaunchService::new(
        db.clone(),
        verification,
        roles.clone(),
        groupings,
        assignments,
        memberships,
        plugins,
        config.lti.authority.clone(),
    );
    let oauth2 = OAuth2Service::new(
        db.clone(),
        http_client.clone(),
        config.lti.oauth2_state_secret.clone(),
    );
    let rosters = RosterService::new(
        db.clone(),
        advantage.clone(),
        roles,
        config.lti.authority.clone(),
    );
    let grading = GradingService::new(http_client, advantage.clone());

    Ok(AppState {
        config,
        db,
        launches,
        oauth2,
        advantage,
        rosters,
        grading,
    })
}

/// Generate the tool's RSA signing key on first boot.
async fn ensure_signing_key(db: &Database) -> Result<(), ServiceError> {
    if db.active_rsa_key().await?.is_none() {
        let key = services::keys::generate_key()?;
        db.insert_rsa_key(key.kid, &key.public_jwk, &key.private_pem)
            .await?;
        tracing::info!(kid = %key.kid, "generated initial RSA signing key");
    }
    Ok(())
}
