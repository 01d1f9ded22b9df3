//! OAuth 2.0 refresh behavior against a live PostgreSQL and a mock LMS.

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lti_service::services::OAuth2Service;

fn oauth2_settings(server_uri: &str) -> Value {
    json!({
        "oauth2": {
            "authorize_url": format!("{server_uri}/authorize"),
            "token_url": format!("{server_uri}/token"),
            "client_id": "cid",
            "client_secret": "cs",
            "redirect_uri": "https://tool.example.com/oauth/callback",
        }
    })
}

fn refresh_grant_mock(delay: Duration) -> Mock {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(delay)
                .set_body_json(json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "expires_in": 3600,
                })),
        )
        .expect(1)
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn concurrent_refreshes_hit_the_token_endpoint_once() {
    // Arrange: an expired row and a slow token endpoint that tolerates
    // exactly one POST.
    let db = common::test_db().await;
    let server = MockServer::start().await;
    refresh_grant_mock(Duration::from_millis(200))
        .mount(&server)
        .await;

    let tenant = common::create_tenant(&db, oauth2_settings(&server.uri())).await;
    let user = common::create_user(&db, &tenant, "Refresher").await;
    let token = db
        .upsert_oauth2_token(tenant.id, user.id, "at-1", Some("rt-1"), Some(0))
        .await
        .unwrap();
    assert!(token.is_expired());

    let service = OAuth2Service::new(db.clone(), reqwest::Client::new(), "state-secret".into());

    // Act: two callers race on the same token row.
    let (a, b) = tokio::join!(
        service.refresh(&tenant, &token),
        service.refresh(&tenant, &token),
    );

    // Assert: both see the refreshed token; the loser re-read the row the
    // winner committed instead of POSTing again (the mock enforces one call).
    assert_eq!(a.unwrap().access_token, "at-2");
    assert_eq!(b.unwrap().access_token, "at-2");
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn refresh_commits_even_when_the_caller_gives_up() {
    // Arrange: the token endpoint answers slower than the caller waits.
    let db = common::test_db().await;
    let server = MockServer::start().await;
    refresh_grant_mock(Duration::from_millis(300))
        .mount(&server)
        .await;

    let tenant = common::create_tenant(&db, oauth2_settings(&server.uri())).await;
    let user = common::create_user(&db, &tenant, "Impatient").await;
    let token = db
        .upsert_oauth2_token(tenant.id, user.id, "at-1", Some("rt-1"), Some(0))
        .await
        .unwrap();

    let service = OAuth2Service::new(db.clone(), reqwest::Client::new(), "state-secret".into());

    // Act: the caller abandons the refresh mid-flight.
    let result =
        tokio::time::timeout(Duration::from_millis(50), service.refresh(&tenant, &token)).await;
    assert!(result.is_err());

    // Assert: the detached refresh still ran to completion and committed.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stored = db
        .find_oauth2_token(tenant.id, user.id)
        .await
        .unwrap()
        .expect("token row disappeared");
    assert_eq!(stored.access_token, "at-2");
    assert!(!stored.is_expired());
}
