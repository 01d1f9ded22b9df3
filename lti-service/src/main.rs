use lti_service::config::LtiConfig;
use lti_service::{AppState, build_state};
use service_core::observability::logging::init_tracing;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = LtiConfig::from_env()?;

    init_tracing(&config.service_name, &config.log_level);

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting LTI service"
    );

    let state = build_state(config).await?;
    tracing::info!("Service graph initialized");

    if state.config.roster.enabled {
        tokio::spawn(roster_refresh_loop(state.clone()));
    }
    tokio::spawn(nonce_purge_loop(state.clone()));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, exiting");
    Ok(())
}

/// Periodically re-fetch the roster of every course that exposed an NRPS
/// endpoint. A failed course logs and moves on; the next cycle retries it.
async fn roster_refresh_loop(state: AppState) {
    let interval = Duration::from_secs(state.config.roster.refresh_interval_seconds);
    loop {
        tokio::time::sleep(interval).await;

        let courses = match state.db.courses_with_roster_endpoint().await {
            Ok(courses) => courses,
            Err(err) => {
                tracing::error!(error = %err, "failed to list courses for roster refresh");
                continue;
            }
        };
        tracing::info!(courses = courses.len(), "starting roster refresh cycle");

        for course in courses {
            let tenant = match state.db.find_tenant_by_id(course.tenant_id).await {
                Ok(Some(tenant)) => tenant,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(course_id = course.id, error = %err, "tenant lookup failed");
                    continue;
                }
            };
            match state.rosters.fetch_course_roster(&tenant, &course).await {
                Ok(_) => match state.db.course_roster(course.id).await {
                    Ok(rows) => {
                        let active = rows.iter().filter(|r| r.active).count();
                        tracing::debug!(
                            course_id = course.id,
                            active,
                            total = rows.len(),
                            "roster refreshed"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(course_id = course.id, error = %err, "roster readback failed");
                    }
                },
                Err(err) => {
                    tracing::warn!(course_id = course.id, error = %err, "roster refresh failed");
                }
            }
        }
    }
}

async fn nonce_purge_loop(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(600));
    loop {
        interval.tick().await;
        match state.db.purge_expired_nonces().await {
            Ok(purged) if purged > 0 => tracing::debug!(purged, "purged expired nonces"),
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "nonce purge failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
