//! End-to-end: detection cycles through the daemon to both consumers.

mod common;

use std::sync::Arc;

use refsync_broker::MemoryBroker;
use refsync_core::config::{BrokerConfig, Config};
use refsync_daemon::{
    CalendarProjection, ConsumerSpec, ContactsProjection, Daemon, MemoryTarget, TargetOp,
};
use refsync_sync::{DetectMode, MemoryFingerprintStore};
use tempfile::TempDir;

use common::{consumer_config, drained, eventually, officials, record, ScriptedSource};

fn config() -> Config {
    Config {
        consumer: consumer_config(3),
        ..Config::default()
    }
}

struct Setup {
    broker: MemoryBroker,
    source: Arc<ScriptedSource>,
    calendar: Arc<MemoryTarget>,
    contacts: Arc<MemoryTarget>,
    daemon: Daemon,
}

fn setup() -> Setup {
    let broker = MemoryBroker::durable(&BrokerConfig::default());
    let source = ScriptedSource::new(vec![record("M1")]);
    let calendar = Arc::new(MemoryTarget::new());
    let contacts = Arc::new(MemoryTarget::new());
    let daemon = Daemon::new(
        config(),
        source.clone(),
        Arc::new(MemoryFingerprintStore::new()),
        Arc::new(broker.clone()),
    )
    .without_schedule()
    .with_consumer(ConsumerSpec::in_memory(
        "calendar",
        calendar.clone(),
        Arc::new(CalendarProjection),
    ))
    .with_consumer(ConsumerSpec::in_memory(
        "contacts",
        contacts.clone(),
        Arc::new(ContactsProjection),
    ));
    Setup {
        broker,
        source,
        calendar,
        contacts,
        daemon,
    }
}

#[tokio::test]
async fn added_assignees_reach_both_consumers_once() {
    let Setup {
        broker,
        source,
        calendar,
        contacts,
        daemon,
    } = setup();
    let handle = daemon.spawn().await.unwrap();

    let first = handle.trigger(DetectMode::Incremental).await.unwrap();
    assert_eq!((first.new, first.updated), (1, 0));
    drained(&broker, "calendar").await;
    drained(&broker, "contacts").await;
    assert!(calendar.get("event/M1").is_some());
    assert!(contacts.get("contact-group/M1").is_some());

    let mut staffed = record("M1");
    staffed["assignees"] = officials();
    source.set(vec![staffed]);
    let second = handle.trigger(DetectMode::Incremental).await.unwrap();
    assert_eq!((second.new, second.updated, second.unchanged), (0, 1, 0));
    drained(&broker, "calendar").await;
    drained(&broker, "contacts").await;

    let event = calendar.get("event/M1").unwrap();
    assert_eq!(event["attendees"].as_array().unwrap().len(), 3);
    let group = contacts.get("contact-group/M1").unwrap();
    assert_eq!(group["officials"].as_array().unwrap().len(), 3);
    for target in [&calendar, &contacts] {
        let upserts = target
            .ops()
            .iter()
            .filter(|op| matches!(op, TargetOp::Upsert { .. }))
            .count();
        assert_eq!(upserts, 2);
    }

    let third = handle.trigger(DetectMode::Incremental).await.unwrap();
    assert_eq!((third.updated, third.envelopes), (0, 0));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_reports_cycle_lag_and_dead_letters() {
    let Setup {
        broker, daemon, ..
    } = setup();
    let handle = daemon.spawn().await.unwrap();

    let before = handle.status().await;
    assert_eq!(before["running"], true);
    assert_eq!(before["tier"], "durable");
    assert!(before["last_cycle"].is_null());

    handle.trigger(DetectMode::ForceResync).await.unwrap();
    drained(&broker, "calendar").await;
    drained(&broker, "contacts").await;

    let status = handle.status().await;
    assert_eq!(status["last_cycle"]["outcome"]["outcome"], "clean");
    assert_eq!(status["last_cycle"]["mode"], "force_resync");
    assert_eq!(status["consumers"][0]["id"], "calendar");
    assert_eq!(status["consumers"][1]["lag"]["pending"], 0);
    assert_eq!(status["dead_letters"], 0);
    assert_eq!(status["parked"], 0);
    assert!(handle.dead_letters().is_empty().await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn from_home_persists_fingerprints_and_processing_records() {
    let home = TempDir::new().unwrap();
    let source = ScriptedSource::new(vec![record("M1"), record("M2")]);
    let calendar = Arc::new(MemoryTarget::new());
    let spec = ConsumerSpec::file_backed(
        home.path(),
        "calendar",
        calendar.clone(),
        Arc::new(CalendarProjection),
    )
    .unwrap();
    let daemon = Daemon::from_home(home.path(), source)
        .unwrap()
        .without_schedule()
        .with_consumer(spec);
    let handle = daemon.spawn().await.unwrap();

    let report = handle.trigger(DetectMode::Incremental).await.unwrap();
    assert_eq!(report.committed, 2);
    let target = calendar.as_ref();
    eventually("both events applied", move || async move {
        target.resources().len() == 2
    })
    .await;
    handle.shutdown().await.unwrap();

    let root = home.path().join(".refsync");
    assert!(root.join("fingerprints.json").exists());
    let ledger = std::fs::read_to_string(root.join("processing/calendar.json")).unwrap();
    assert!(ledger.contains("\"M1\"") && ledger.contains("\"M2\""));
}
