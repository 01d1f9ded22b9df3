use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct LtiConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub lti: LtiSettings,
    pub http: HttpConfig,
    pub roster: RosterConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LtiSettings {
    /// Authority suffix of every `h_userid` minted by this deployment.
    pub authority: String,
    /// HMAC secret sealing OAuth2 redirect state.
    pub oauth2_state_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterConfig {
    pub enabled: bool,
    pub refresh_interval_seconds: u64,
}

impl LtiConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;

        let config = LtiConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("lti-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
            },
            lti: LtiSettings {
                authority: get_env("LTI_AUTHORITY", Some("lms.hypothes.is"), is_prod)?,
                oauth2_state_secret: get_env("OAUTH2_STATE_SECRET", None, true)?,
            },
            http: HttpConfig {
                timeout_seconds: get_env("HTTP_TIMEOUT_SECONDS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
            },
            roster: RosterConfig {
                enabled: get_env("ROSTER_REFRESH_ENABLED", Some("true"), is_prod)?
                    .parse()
                    .unwrap_or(true),
                refresh_interval_seconds: get_env(
                    "ROSTER_REFRESH_INTERVAL_SECONDS",
                    Some("3600"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3600),
            },
        };

        Ok(config)
    }
}

/// Read an environment variable. Defaults apply outside prod; in prod a
/// missing variable without an explicit default is a configuration error.
fn get_env(name: &str, default: Option<&str>, required: bool) -> Result<String, AppError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => match default {
            Some(default) => Ok(default.to_string()),
            None => Err(AppError::ConfigError(anyhow::anyhow!(
                if required {
                    format!("missing required environment variable {name}")
                } else {
                    format!("missing environment variable {name}")
                }
            ))),
        },
    }
}
