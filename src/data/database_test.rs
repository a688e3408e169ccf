//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn test_link(source_handle: &str, sink_id: i64) -> LinkedAccount {
    let now = Utc::now();
    LinkedAccount {
        id: EntityId::new().0,
        source_handle: source_handle.to_string(),
        sink_id,
        delivery_token: format!("token-{}", sink_id),
        callback_endpoint: "https://sink.example.com/push".to_string(),
        notifications_enabled: true,
        revoked_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_link_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;

    let link = test_link("alice", 42);
    assert!(db.insert_link_if_absent(&link).await.unwrap());

    // Retrieve active link
    let retrieved = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(retrieved.sink_id, 42);
    assert!(retrieved.notifications_enabled);
    assert!(retrieved.revoked_at.is_none());

    // Refresh credentials
    let refreshed = db
        .refresh_link(
            "alice",
            "rotated-token",
            "https://sink.example.com/push2",
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(refreshed);
    let retrieved = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(retrieved.delivery_token, "rotated-token");

    // Revoke; second revoke finds nothing active
    assert!(db.revoke_link("alice", Utc::now()).await.unwrap());
    assert!(!db.revoke_link("alice", Utc::now()).await.unwrap());
    assert!(db.get_active_link("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_link_if_absent_rejects_second_active() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(db.insert_link_if_absent(&test_link("alice", 1)).await.unwrap());
    // A second active link for the same handle hits the partial unique
    // index and is ignored.
    assert!(!db.insert_link_if_absent(&test_link("alice", 2)).await.unwrap());

    let active = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(active.sink_id, 1);

    // After revocation the handle is free again
    db.revoke_link("alice", Utc::now()).await.unwrap();
    assert!(db.insert_link_if_absent(&test_link("alice", 2)).await.unwrap());
    let active = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(active.sink_id, 2);
}

#[tokio::test]
async fn test_supersede_link_swaps_active_row() {
    let (db, _temp_dir) = create_test_db().await;

    db.insert_link_if_absent(&test_link("alice", 1)).await.unwrap();
    db.supersede_link(&test_link("alice", 2), Utc::now())
        .await
        .unwrap();

    let active = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(active.sink_id, 2);

    // The old row survives as a revoked historical record
    assert_eq!(db.count_active_links().await.unwrap(), 1);
    let by_old_sink = db.get_links_by_sink_id(1).await.unwrap();
    assert!(by_old_sink.is_empty());
}

#[tokio::test]
async fn test_eligible_links_excludes_disabled_and_revoked() {
    let (db, _temp_dir) = create_test_db().await;

    db.insert_link_if_absent(&test_link("alice", 1)).await.unwrap();
    db.insert_link_if_absent(&test_link("bob", 2)).await.unwrap();
    db.insert_link_if_absent(&test_link("carol", 3)).await.unwrap();

    db.set_notifications_enabled("bob", false, Utc::now())
        .await
        .unwrap();
    db.revoke_link("carol", Utc::now()).await.unwrap();

    let eligible = db.list_eligible_links().await.unwrap();
    let handles: Vec<_> = eligible.iter().map(|l| l.source_handle.as_str()).collect();
    assert_eq!(handles, vec!["alice"]);
}

#[tokio::test]
async fn test_sink_id_bulk_operations() {
    let (db, _temp_dir) = create_test_db().await;

    // Two handles sharing one sink app id
    db.insert_link_if_absent(&test_link("alice", 7)).await.unwrap();
    db.insert_link_if_absent(&test_link("bob", 7)).await.unwrap();
    db.insert_link_if_absent(&test_link("carol", 8)).await.unwrap();

    let links = db.get_links_by_sink_id(7).await.unwrap();
    assert_eq!(links.len(), 2);

    // Disable by sink id
    let updated = db
        .set_notifications_enabled_by_sink_id(7, false, Utc::now())
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert!(db.list_eligible_links().await.unwrap().iter().all(|l| l.source_handle == "carol"));

    // Rotate credentials by sink id
    let rotated = db
        .rotate_delivery_token_by_sink_id(7, "new-token", "https://sink.example.com/v2", Utc::now())
        .await
        .unwrap();
    assert_eq!(rotated, 2);
    let alice = db.get_active_link("alice").await.unwrap().unwrap();
    assert_eq!(alice.delivery_token, "new-token");

    // Revoke by sink id
    let revoked = db.revoke_links_by_sink_id(7, Utc::now()).await.unwrap();
    assert_eq!(revoked, 2);
    assert_eq!(db.count_active_links().await.unwrap(), 1);
}

#[tokio::test]
async fn test_read_cursor_is_monotonic() {
    let (db, _temp_dir) = create_test_db().await;

    let t1 = Utc::now();
    let t2 = t1 + Duration::minutes(5);
    let t3 = t1 + Duration::minutes(10);

    assert!(db.get_read_cursor("alice").await.unwrap().is_none());

    db.advance_read_cursor("alice", t2, t2).await.unwrap();
    let cursor = db.get_read_cursor("alice").await.unwrap().unwrap();
    assert_eq!(cursor.last_acknowledged_at, t2);

    // Attempting to move backwards is a no-op
    db.advance_read_cursor("alice", t1, t3).await.unwrap();
    let cursor = db.get_read_cursor("alice").await.unwrap().unwrap();
    assert_eq!(cursor.last_acknowledged_at, t2);

    db.advance_read_cursor("alice", t3, t3).await.unwrap();
    let cursor = db.get_read_cursor("alice").await.unwrap().unwrap();
    assert_eq!(cursor.last_acknowledged_at, t3);
}

const PENDING_TIMEOUT: Duration = Duration::minutes(10);
const FAILURE_BACKOFF: Duration = Duration::hours(24);
const MAX_ATTEMPTS: i64 = 3;

async fn claim(db: &Database, handle: &str, event: &str, now: chrono::DateTime<Utc>) -> ClaimOutcome {
    db.claim_delivery(handle, event, now, PENDING_TIMEOUT, FAILURE_BACKOFF, MAX_ATTEMPTS)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_claim_fresh_pair_then_busy() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);
    // The claim is fresh; a second caller must not proceed
    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Busy);
}

#[tokio::test]
async fn test_claim_race_has_single_winner() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    let (a, b) = tokio::join!(
        db.claim_delivery("alice", "vote#123", now, PENDING_TIMEOUT, FAILURE_BACKOFF, MAX_ATTEMPTS),
        db.claim_delivery("alice", "vote#123", now, PENDING_TIMEOUT, FAILURE_BACKOFF, MAX_ATTEMPTS),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let winners = outcomes
        .iter()
        .filter(|o| **o == ClaimOutcome::Claimed)
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_claim_after_sent_is_already_delivered() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);
    assert!(db.record_delivery_sent("alice", "vote#123", now).await.unwrap());

    // Even far in the future, sent is terminal
    let later = now + Duration::days(2);
    assert_eq!(
        claim(&db, "alice", "vote#123", later).await,
        ClaimOutcome::AlreadyDelivered
    );
}

#[tokio::test]
async fn test_claim_reclaims_stuck_pending() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);

    // Before the timeout the claim belongs to someone else
    let early = now + PENDING_TIMEOUT - Duration::seconds(1);
    assert_eq!(claim(&db, "alice", "vote#123", early).await, ClaimOutcome::Busy);

    // After the timeout the stuck claim is reclaimable
    let late = now + PENDING_TIMEOUT + Duration::seconds(1);
    assert_eq!(claim(&db, "alice", "vote#123", late).await, ClaimOutcome::Claimed);
}

#[tokio::test]
async fn test_failed_entry_respects_backoff_and_attempt_cap() {
    let (db, _temp_dir) = create_test_db().await;
    let mut now = Utc::now();

    // First attempt fails
    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);
    let attempts = db
        .record_delivery_failure("alice", "vote#123", "invalid_token", now)
        .await
        .unwrap();
    assert_eq!(attempts, Some(1));

    // Inside the backoff window the entry is not retried
    let early = now + FAILURE_BACKOFF - Duration::minutes(1);
    assert_eq!(
        claim(&db, "alice", "vote#123", early).await,
        ClaimOutcome::NotEligible
    );

    // Two more failures on the decayed schedule
    for expected_attempts in [2, 3] {
        now = now + FAILURE_BACKOFF + Duration::minutes(1);
        assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);
        let attempts = db
            .record_delivery_failure("alice", "vote#123", "invalid_token", now)
            .await
            .unwrap();
        assert_eq!(attempts, Some(expected_attempts));
    }

    // Attempts are exhausted; the entry is dropped permanently
    let much_later = now + FAILURE_BACKOFF + Duration::days(7);
    assert_eq!(
        claim(&db, "alice", "vote#123", much_later).await,
        ClaimOutcome::NotEligible
    );
}

#[tokio::test]
async fn test_record_outcome_requires_our_pending_claim() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    // No claim at all
    assert!(!db.record_delivery_sent("alice", "vote#123", now).await.unwrap());

    assert_eq!(claim(&db, "alice", "vote#123", now).await, ClaimOutcome::Claimed);
    assert!(db.record_delivery_sent("alice", "vote#123", now).await.unwrap());

    // Terminal rows are not overwritten by late recorders
    assert!(!db
        .record_delivery_suppressed("alice", "vote#123", "link_disabled", now)
        .await
        .unwrap());
    let late_failure = db
        .record_delivery_failure("alice", "vote#123", "invalid_token", now)
        .await
        .unwrap();
    assert_eq!(late_failure, None);

    let entry = db.get_ledger_entry("alice", "vote#123").await.unwrap().unwrap();
    assert_eq!(entry.outcome, "sent");
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn test_get_ledger_entries_scopes_by_handle() {
    let (db, _temp_dir) = create_test_db().await;
    let now = Utc::now();

    claim(&db, "alice", "vote#1", now).await;
    claim(&db, "alice", "vote#2", now).await;
    claim(&db, "bob", "vote#1", now).await;

    let entries = db
        .get_ledger_entries(
            "alice",
            &["vote#1".to_string(), "vote#2".to_string(), "vote#3".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.source_handle == "alice"));

    let empty = db.get_ledger_entries("alice", &[]).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_purge_spares_pending_and_retryable_failures() {
    let (db, _temp_dir) = create_test_db().await;
    let old = Utc::now() - Duration::days(60);

    // Old sent entry
    claim(&db, "alice", "vote#sent", old).await;
    db.record_delivery_sent("alice", "vote#sent", old).await.unwrap();

    // Old suppressed entry
    claim(&db, "alice", "vote#supp", old).await;
    db.record_delivery_suppressed("alice", "vote#supp", "link_disabled", old)
        .await
        .unwrap();

    // Old failure with attempts remaining
    claim(&db, "alice", "vote#retryable", old).await;
    db.record_delivery_failure("alice", "vote#retryable", "quota", old)
        .await
        .unwrap();

    // Old exhausted failure
    let mut t = old;
    claim(&db, "alice", "vote#dead", t).await;
    db.record_delivery_failure("alice", "vote#dead", "invalid_token", t)
        .await
        .unwrap();
    for _ in 0..2 {
        t = t + FAILURE_BACKOFF + Duration::minutes(1);
        claim(&db, "alice", "vote#dead", t).await;
        db.record_delivery_failure("alice", "vote#dead", "invalid_token", t)
            .await
            .unwrap();
    }

    // Old pending claim, never resolved
    claim(&db, "alice", "vote#stuck", old).await;

    let cutoff = Utc::now() - Duration::days(30);
    let purged = db.purge_ledger_older_than(cutoff, MAX_ATTEMPTS).await.unwrap();
    assert_eq!(purged, 3);

    // Pending and retryable failures survive
    assert!(db.get_ledger_entry("alice", "vote#stuck").await.unwrap().is_some());
    assert!(db.get_ledger_entry("alice", "vote#retryable").await.unwrap().is_some());
    assert!(db.get_ledger_entry("alice", "vote#sent").await.unwrap().is_none());
    assert!(db.get_ledger_entry("alice", "vote#supp").await.unwrap().is_none());
    assert!(db.get_ledger_entry("alice", "vote#dead").await.unwrap().is_none());
}
