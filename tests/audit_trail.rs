//! End-to-end audit trail: append, verify, tamper detection, gated reads,
//! alerting, retention.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dispatch::audit::{
    AlertSeverity, AuditAccessRole, AuditAlertEngine, AuditAlertOptions, AuditAlertRule,
    AuditError, AuditEvent, AuditEventType, AuditOutcome, AuditQuery, AuditRetentionOptions,
    AuditRetentionService, AuditStore, InMemoryAuditStore, RbacAuditReadGuard,
};
use dispatch::audit::alerts::RecordingNotificationChannel;
use dispatch::audit::rbac::StaticRoleProvider;

fn login_event(actor: &str, outcome: AuditOutcome) -> AuditEvent {
    AuditEvent::new(AuditEventType::Authentication, "User.Login", actor, outcome)
        .with_ip_address("10.0.0.7")
}

#[cfg(feature = "sqlite")]
mod sqlite_chain {
    use super::*;
    use dispatch::audit::{AuditIntegrityResult, SqliteAuditStore};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_store() -> (SqliteAuditStore, sqlx::SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let store = SqliteAuditStore::new(pool.clone());
        store.init().await.unwrap();
        (store, pool)
    }

    #[tokio::test]
    async fn tampering_with_persisted_action_breaks_the_chain() {
        let (store, pool) = create_store().await;
        let _e1 = store
            .store(login_event("alice", AuditOutcome::Success))
            .await
            .unwrap();
        let e2 = store
            .store(login_event("bob", AuditOutcome::Failure))
            .await
            .unwrap();
        let _e3 = store
            .store(login_event("carol", AuditOutcome::Success))
            .await
            .unwrap();

        assert!(store
            .verify_chain_integrity(None, None)
            .await
            .unwrap()
            .is_valid());

        sqlx::query("UPDATE audit_events SET action = 'User.Logout' WHERE event_id = ?")
            .bind(&e2.event_id)
            .execute(&pool)
            .await
            .unwrap();

        match store.verify_chain_integrity(None, None).await.unwrap() {
            AuditIntegrityResult::Invalid {
                first_violation_event_id,
                events_verified,
                ..
            } => {
                assert_eq!(first_violation_event_id, e2.event_id);
                assert_eq!(events_verified, 3);
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn gated_reads_leave_a_meta_trail() {
    let inner = Arc::new(InMemoryAuditStore::default());
    let meta = Arc::new(InMemoryAuditStore::default());
    for n in 0..3 {
        inner
            .store(login_event(&format!("user-{n}"), AuditOutcome::Success))
            .await
            .unwrap();
    }

    let guard = RbacAuditReadGuard::new(
        inner.clone(),
        meta.clone(),
        Arc::new(StaticRoleProvider(AuditAccessRole::Auditor)),
    );

    let events = guard.query(&AuditQuery::default()).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(guard
        .verify_chain_integrity(None, None)
        .await
        .unwrap()
        .is_valid());

    // Both reads left a Security meta-event, and the meta log itself chains.
    let meta_events = meta.query(&AuditQuery::default()).await.unwrap();
    let actions: Vec<&str> = meta_events.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"AuditLog.Query"));
    assert!(actions.contains(&"AuditLog.VerifyIntegrity"));
    assert!(meta
        .verify_chain_integrity(None, None)
        .await
        .unwrap()
        .is_valid());
}

#[tokio::test]
async fn denied_reader_cannot_see_the_log() {
    let inner = Arc::new(InMemoryAuditStore::default());
    let meta = Arc::new(InMemoryAuditStore::default());
    inner
        .store(login_event("alice", AuditOutcome::Success))
        .await
        .unwrap();

    let guard = RbacAuditReadGuard::new(
        inner,
        meta.clone(),
        Arc::new(StaticRoleProvider(AuditAccessRole::Unauthorized)),
    );

    assert!(matches!(
        guard.query(&AuditQuery::default()).await,
        Err(AuditError::PermissionDenied(_))
    ));

    let meta_events = meta.query(&AuditQuery::default()).await.unwrap();
    assert_eq!(meta_events.len(), 1);
    assert_eq!(meta_events[0].outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn failed_logins_alert_until_the_quota_runs_out() {
    let channel = Arc::new(RecordingNotificationChannel::new());
    let engine = AuditAlertEngine::new(
        channel.clone(),
        AuditAlertOptions {
            max_alerts_per_minute: 2,
            ..Default::default()
        },
    );
    engine
        .register_rule(
            AuditAlertRule::new("failed-logins", AlertSeverity::Warning, |event| {
                event.outcome == AuditOutcome::Failure
            })
            .with_channel("security-pager"),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    for n in 0..5 {
        engine
            .evaluate(&login_event(&format!("user-{n}"), AuditOutcome::Failure), &cancel)
            .await
            .unwrap();
    }

    assert_eq!(engine.evaluation_count(), 5);
    let alerts = channel.alerts().await;
    assert_eq!(alerts.len(), 2);
    assert!(alerts
        .iter()
        .all(|a| a.notification_channel.as_deref() == Some("security-pager")));
    assert_eq!(engine.alerts_suppressed(), 3);
}

#[tokio::test]
async fn retention_truncates_but_the_survivors_still_verify() {
    let store = Arc::new(InMemoryAuditStore::default());
    for n in 0..4 {
        let mut event = login_event(&format!("user-{n}"), AuditOutcome::Success);
        event.timestamp = chrono::Utc::now() - chrono::Duration::days(30);
        store.store(event).await.unwrap();
    }
    store
        .store(login_event("fresh", AuditOutcome::Success))
        .await
        .unwrap();

    let service = AuditRetentionService::new(
        store.clone(),
        AuditRetentionOptions {
            retention_period_days: 7,
            batch_size: 100,
            ..Default::default()
        },
    );
    let deleted = service.run_once().await.unwrap();
    assert_eq!(deleted, 4);
    assert_eq!(store.len().await, 1);

    // The anchor checkpoint keeps the surviving range verifiable and new
    // appends keep chaining.
    assert!(store
        .verify_chain_integrity(None, None)
        .await
        .unwrap()
        .is_valid());
    store
        .store(login_event("after-sweep", AuditOutcome::Success))
        .await
        .unwrap();
    assert!(store
        .verify_chain_integrity(None, None)
        .await
        .unwrap()
        .is_valid());
}
