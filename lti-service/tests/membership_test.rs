//! Membership and roster persistence against a live PostgreSQL.

mod common;

use chrono::{DateTime, Utc};
use lti_service::models::RoleKind;
use lti_service::services::Database;
use lti_service::services::database::PreparedRosterRow;

async fn membership_rows(
    db: &Database,
    course_id: i64,
    user_id: i64,
) -> Vec<(i64, DateTime<Utc>)> {
    sqlx::query_as(
        r#"
        SELECT id, updated FROM course_memberships
        WHERE course_id = $1 AND user_id = $2
        ORDER BY id
        "#,
    )
    .bind(course_id)
    .bind(user_id)
    .fetch_all(db.pool())
    .await
    .expect("Failed to read membership rows")
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn repeated_membership_upsert_keeps_one_row_per_role() {
    // Arrange
    let db = common::test_db().await;
    let tenant = common::create_tenant(&db, serde_json::json!({})).await;
    let course = common::create_course(&db, &tenant).await;
    let user = common::create_user(&db, &tenant, "Repeat Launcher").await;
    let learner = common::create_role(&db, "learner", RoleKind::Learner).await;
    let instructor = common::create_role(&db, "instructor", RoleKind::Instructor).await;
    let role_ids = [learner.id, instructor.id];

    // Act: the same launch lands twice.
    db.upsert_course_memberships(course.id, user.id, &role_ids)
        .await
        .unwrap();
    let first = membership_rows(&db, course.id, user.id).await;
    db.upsert_course_memberships(course.id, user.id, &role_ids)
        .await
        .unwrap();
    let second = membership_rows(&db, course.id, user.id).await;

    // Assert: one row per role, the same rows both times, and `updated`
    // moved forward rather than new rows appearing.
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    for ((id_a, updated_a), (id_b, updated_b)) in first.iter().zip(&second) {
        assert_eq!(id_a, id_b);
        assert!(updated_b >= updated_a);
    }
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn roster_replacement_deactivates_missing_members_without_deleting() {
    // Arrange
    let db = common::test_db().await;
    let tenant = common::create_tenant(&db, serde_json::json!({})).await;
    let course = common::create_course(&db, &tenant).await;
    let alice = common::create_user(&db, &tenant, "Alice").await;
    let bob = common::create_user(&db, &tenant, "Bob").await;
    let carol = common::create_user(&db, &tenant, "Carol").await;
    let learner = common::create_role(&db, "learner", RoleKind::Learner).await;
    let row = |user_id, active| PreparedRosterRow {
        user_id,
        lti_role_id: learner.id,
        active,
    };

    // Act: first fetch sees Alice and Bob; the next one reports Alice and
    // Carol active and Bob dropped.
    db.replace_course_roster(course.id, &[row(alice.id, true), row(bob.id, true)])
        .await
        .unwrap();
    db.replace_course_roster(
        course.id,
        &[row(alice.id, true), row(carol.id, true), row(bob.id, false)],
    )
    .await
    .unwrap();

    // Assert: three rows, Bob inactive, nobody deleted.
    let roster = db.course_roster(course.id).await.unwrap();
    assert_eq!(roster.len(), 3);
    let active_of = |user_id| {
        roster
            .iter()
            .find(|r| r.user_id == user_id)
            .expect("roster row missing")
            .active
    };
    assert!(active_of(alice.id));
    assert!(!active_of(bob.id));
    assert!(active_of(carol.id));

    // Act again: a fetch that returns only Alice flips everyone else.
    db.replace_course_roster(course.id, &[row(alice.id, true)])
        .await
        .unwrap();

    let roster = db.course_roster(course.id).await.unwrap();
    assert_eq!(roster.len(), 3);
    let active_of = |user_id| {
        roster
            .iter()
            .find(|r| r.user_id == user_id)
            .expect("roster row missing")
            .active
    };
    assert!(active_of(alice.id));
    assert!(!active_of(bob.id));
    assert!(!active_of(carol.id));
}
