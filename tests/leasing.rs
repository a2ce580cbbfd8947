//! Leasing, reservation and liveness integration tests

use std::sync::Arc;

use chrono::{Duration, Utc};
use tether_gateway::db::{DeviceRepo, DeviceState, UsageFilter};
use tether_gateway::notify::ChannelTransport;
use tether_gateway::{AcquireOptions, Error, Principal, ReleaseOutcome};
use tokio_test::{assert_err, assert_ok};

mod common;
use common::{announce_device, setup_test_db, start_components};

fn root() -> Principal {
    Principal::admin("root", "ops")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_grant_exactly_one_lease() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);

    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = Arc::clone(&components.coordinator);
        handles.push(tokio::spawn(async move {
            let principal = Principal::new(format!("user-{i}"), "g1");
            coordinator
                .acquire("d1", &principal, AcquireOptions::default())
                .await
        }));
    }

    let mut granted = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(Error::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(granted, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(components.coordinator.ledger().open_sessions().unwrap().len(), 1);
    assert_eq!(components.coordinator.table().len(), 1);
}

#[tokio::test]
async fn reconnect_returns_the_same_session() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);
    let alice = Principal::new("alice", "g1");

    let first = assert_ok!(
        components
            .coordinator
            .acquire("d1", &alice, AcquireOptions::default())
            .await
    );
    let second = assert_ok!(
        components
            .coordinator
            .acquire(
                "d1",
                &alice,
                AcquireOptions {
                    client_meta: Some("10.0.0.9".to_string()),
                    force: false,
                },
            )
            .await
    );

    assert!(!first.reconnected);
    assert!(second.reconnected);
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.client_meta.as_deref(), Some("10.0.0.9"));

    let history = components
        .coordinator
        .ledger()
        .history(&UsageFilter::default())
        .unwrap();
    assert_eq!(history.len(), 1);

    // Someone else still cannot take it
    assert_err!(
        components
            .coordinator
            .acquire("d1", &Principal::new("bob", "g1"), AcquireOptions::default())
            .await
    );
}

#[tokio::test]
async fn sharing_scenario_end_to_end() {
    let db = setup_test_db();
    announce_device(&db, "D1", "G1");
    let components = start_components(&db);
    let u2 = Principal::new("U2", "G2");
    let u3 = Principal::new("U3", "G2");

    // Without an agreement G2 has no access
    assert!(matches!(
        components
            .coordinator
            .acquire("D1", &u2, AcquireOptions::default())
            .await,
        Err(Error::PermissionDenied(_))
    ));

    components
        .access
        .set_sharing(&root(), "G1", "G2", true)
        .await
        .unwrap();

    let lease = components
        .coordinator
        .acquire("D1", &u2, AcquireOptions::default())
        .await
        .unwrap();
    assert_eq!(lease.holder, "U2");

    assert!(matches!(
        components
            .coordinator
            .acquire("D1", &u3, AcquireOptions::default())
            .await,
        Err(Error::Conflict(_))
    ));

    // Sharing grants use, never admin
    assert!(matches!(
        components.coordinator.release("D1", &u3, true).await,
        Err(Error::PermissionDenied(_))
    ));

    let outcome = components
        .coordinator
        .release("D1", &root(), true)
        .await
        .unwrap();
    assert!(matches!(outcome, ReleaseOutcome::Forced { ref holder, .. } if holder == "U2"));

    let status = components.coordinator.status("D1").unwrap();
    assert_eq!(status.device.state, DeviceState::Available);
    assert!(status.lease.is_none());
}

#[tokio::test]
async fn stale_device_goes_offline_exactly_once() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);
    let alice = Principal::new("alice", "g1");

    components
        .coordinator
        .acquire("d1", &alice, AcquireOptions::default())
        .await
        .unwrap();

    let (transport, mut rx) = ChannelTransport::new("watcher", 32);
    components
        .hub
        .subscribe(Arc::new(transport), vec!["d1".to_string()], Vec::new());

    DeviceRepo::new(db.clone())
        .touch_heartbeat("d1", Utc::now() - Duration::minutes(10))
        .unwrap();

    let first = components.tracker.sweep().await.unwrap();
    let second = components.tracker.sweep().await.unwrap();
    assert_eq!(first.devices_evicted, 1);
    assert_eq!(second.devices_evicted, 0);

    let mut offline_events = 0;
    let mut alerts = 0;
    while let Ok(payload) = rx.try_recv() {
        let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
        match event["type"].as_str() {
            Some("device_status") if event["data"]["state"] == "offline" => offline_events += 1,
            Some("alert") => alerts += 1,
            _ => {}
        }
    }
    assert_eq!(offline_events, 1);
    assert_eq!(alerts, 1);

    let session = &components
        .coordinator
        .ledger()
        .history(&UsageFilter::default())
        .unwrap()[0];
    assert!(!session.is_open());

    // A fresh heartbeat brings the device back
    DeviceRepo::new(db.clone())
        .touch_heartbeat("d1", Utc::now())
        .unwrap();
    assert!(components.coordinator.restore("d1").await.unwrap());
    assert_eq!(
        components.coordinator.status("d1").unwrap().device.state,
        DeviceState::Available
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_approvals_race_to_one_winner() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);
    let now = Utc::now();

    let first = components
        .planner
        .create(
            "d1",
            &Principal::new("alice", "g1"),
            now + Duration::hours(1),
            now + Duration::hours(2),
            None,
        )
        .await
        .unwrap();
    let second = components
        .planner
        .create(
            "d1",
            &Principal::new("bob", "g1"),
            now + Duration::minutes(90),
            now + Duration::hours(3),
            None,
        )
        .await
        .unwrap();

    let approver = root();
    let (a, b) = tokio::join!(
        components.planner.handle(&first.id, &approver, true, None),
        components.planner.handle(&second.id, &approver, true, None),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::Conflict(_))))
            .count(),
        1
    );
}

#[tokio::test]
async fn touching_reservations_do_not_overlap() {
    let db = setup_test_db();
    announce_device(&db, "d1", "g1");
    let components = start_components(&db);
    let alice = Principal::new("alice", "g1");
    let bob = Principal::new("bob", "g1");
    let t1 = Utc::now() + Duration::hours(1);
    let t2 = t1 + Duration::hours(1);
    let t3 = t2 + Duration::hours(1);

    let booked = components
        .planner
        .create("d1", &alice, t1, t2, Some("demo"))
        .await
        .unwrap();
    components
        .planner
        .handle(&booked.id, &root(), true, None)
        .await
        .unwrap();

    let adjacent = components
        .planner
        .create("d1", &bob, t2, t3, None)
        .await
        .unwrap();
    components
        .planner
        .handle(&adjacent.id, &root(), true, None)
        .await
        .unwrap();

    assert!(matches!(
        components
            .planner
            .create("d1", &bob, t2 - Duration::seconds(1), t3, None)
            .await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        components.planner.create("d1", &bob, t3, t3, None).await,
        Err(Error::Validation(_))
    ));
}
