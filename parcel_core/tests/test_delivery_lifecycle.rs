//! Lifecycle of a receiver's delivery slot through intake, poll, fetch and complete.

use bytes::Bytes;
use parcel_core::delivery::{Broker, BrokerOptions, DeliveryRequest, PayloadStore, Registry};
use parcel_core::{AckMode, BrokerError, RetentionPolicy, SlotStatus};
use tempfile::TempDir;

async fn setup(ack_mode: AckMode) -> (TempDir, Broker) {
    let dir = tempfile::tempdir().unwrap();
    let store = PayloadStore::open(dir.path().join("payloads")).await.unwrap();
    let options = BrokerOptions {
        ack_mode,
        ..BrokerOptions::default()
    };
    (dir, Broker::new(Registry::in_memory(), store, options))
}

fn request(receiver: &str, file_name: &str, target_path: &str, execute: bool) -> DeliveryRequest {
    DeliveryRequest {
        receiver_id: receiver.to_string(),
        file_name: file_name.to_string(),
        target_path: target_path.to_string(),
        execute,
    }
}

async fn send(broker: &Broker, receiver: &str, file_name: &str, bytes: &'static [u8]) -> String {
    broker
        .intake_bytes(
            request(receiver, file_name, "/tmp", false),
            Some(Bytes::from_static(bytes)),
        )
        .await
        .expect("intake should succeed")
        .payload_key
}

fn payload_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path().join("payloads"))
        .unwrap()
        .count()
}

#[tokio::test]
async fn test_unregistered_receiver_is_unknown_everywhere() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;

    assert!(matches!(
        broker.poll("ghost").await,
        Err(BrokerError::UnknownReceiver(_))
    ));
    assert!(matches!(
        broker.complete("ghost").await,
        Err(BrokerError::UnknownReceiver(_))
    ));

    let slot = parcel_core::DeliverySlot {
        payload_key: "67686f7374_00000000_a.txt".to_string(),
        original_name: "a.txt".to_string(),
        target_path: String::new(),
        execute: false,
        status: SlotStatus::Pending,
        size: 0,
        payload_hash: None,
        created_at: 0,
    };
    assert!(matches!(
        broker.registry().set_slot("ghost", slot).await,
        Err(BrokerError::UnknownReceiver(_))
    ));
}

#[tokio::test]
async fn test_intake_for_unknown_receiver_persists_nothing() {
    let (dir, broker) = setup(AckMode::FetchClears).await;

    let result = broker
        .intake_bytes(
            request("ghost", "a.txt", "/tmp", false),
            Some(Bytes::from_static(b"hi")),
        )
        .await;

    assert!(matches!(result, Err(BrokerError::UnknownReceiver(_))));
    assert_eq!(payload_count(&dir), 0, "no payload may be left behind");
}

#[tokio::test]
async fn test_full_fetch_clears_scenario() {
    let (dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", Some("Desk")).await.unwrap();

    let receipt = broker
        .intake_bytes(
            request("r1", "a.txt", "/tmp", false),
            Some(Bytes::from_static(b"hi")),
        )
        .await
        .unwrap();
    assert_eq!(receipt.file_name, "a.txt");
    assert_eq!(receipt.receiver_id, "r1");

    let slot = broker.poll("r1").await.unwrap().expect("slot should be pending");
    assert_eq!(slot.original_name, "a.txt");
    assert_eq!(slot.target_path, "/tmp");
    assert!(!slot.execute);
    assert_eq!(slot.status, SlotStatus::Pending);
    assert_eq!(slot.payload_key, receipt.payload_key);
    assert_eq!(slot.size, 2);

    let fetched = broker.fetch(&slot.payload_key).await.unwrap();
    assert!(fetched.cleared_slot);
    assert_eq!(fetched.stream.collect_bytes().await.unwrap(), b"hi");

    assert!(broker.poll("r1").await.unwrap().is_none());
    assert!(broker.inspect("r1").await.unwrap().is_none());
    assert_eq!(payload_count(&dir), 0, "fetched payload should be released");
}

#[tokio::test]
async fn test_second_intake_overwrites_first() {
    let (dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", None).await.unwrap();

    let first = send(&broker, "r1", "f1.txt", b"one").await;
    let second = send(&broker, "r1", "f2.txt", b"two").await;

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.original_name, "f2.txt");
    assert_eq!(slot.payload_key, second);

    // The displaced payload is gone; only the live one remains
    assert!(matches!(
        broker.fetch(&first).await,
        Err(BrokerError::PayloadNotFound(_))
    ));
    assert_eq!(payload_count(&dir), 1);
}

#[tokio::test]
async fn test_fetch_unknown_key_mutates_nothing() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", None).await.unwrap();
    let key = send(&broker, "r1", "a.txt", b"hi").await;

    for bogus in ["7231_deadbeef_a.txt", "not-a-key", "..", "7231_deadbeef_..%2Fsecret"] {
        assert!(matches!(
            broker.fetch(bogus).await,
            Err(BrokerError::PayloadNotFound(_))
        ));
    }

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.payload_key, key);
}

#[tokio::test]
async fn test_stale_fetch_does_not_clear_newer_slot() {
    let dir = tempfile::tempdir().unwrap();
    let store = PayloadStore::open(dir.path().join("payloads")).await.unwrap();
    let options = BrokerOptions {
        retention: RetentionPolicy::Keep,
        ..BrokerOptions::default()
    };
    let broker = Broker::new(Registry::in_memory(), store, options);
    broker.register("r1", None).await.unwrap();

    let old_key = send(&broker, "r1", "old.txt", b"old").await;
    let new_key = send(&broker, "r1", "new.txt", b"new").await;

    // The old payload is still on disk, but the slot now belongs to the new one
    let fetched = broker.fetch(&old_key).await.unwrap();
    assert!(!fetched.cleared_slot);
    assert_eq!(fetched.stream.collect_bytes().await.unwrap(), b"old");

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.payload_key, new_key);
}

#[tokio::test]
async fn test_download_in_flight_survives_overwrite() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", None).await.unwrap();
    let old_key = send(&broker, "r1", "old.txt", b"old").await;

    let fetched = broker.fetch(&old_key).await.unwrap();
    assert!(fetched.cleared_slot);
    let new_key = send(&broker, "r1", "new.txt", b"new").await;
    drop(fetched);

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.payload_key, new_key);
    assert!(broker.fetch(&new_key).await.is_ok());
}

#[tokio::test]
async fn test_complete_marks_without_removing() {
    let (_dir, broker) = setup(AckMode::ExplicitComplete).await;
    broker.register("r1", None).await.unwrap();
    let key = send(&broker, "r1", "a.txt", b"hi").await;

    let fetched = broker.fetch(&key).await.unwrap();
    assert!(!fetched.cleared_slot);
    drop(fetched);
    assert!(broker.poll("r1").await.unwrap().is_some());

    assert!(broker.complete("r1").await.unwrap());
    assert!(broker.poll("r1").await.unwrap().is_none());

    let slot = broker.inspect("r1").await.unwrap().expect("slot is kept");
    assert_eq!(slot.status, SlotStatus::Completed);
    assert_eq!(slot.payload_key, key);

    // Completing again is a no-op, not an error
    assert!(!broker.complete("r1").await.unwrap());
}

#[tokio::test]
async fn test_new_intake_reopens_completed_slot() {
    let (_dir, broker) = setup(AckMode::ExplicitComplete).await;
    broker.register("r1", None).await.unwrap();
    send(&broker, "r1", "a.txt", b"hi").await;
    broker.complete("r1").await.unwrap();

    let key = send(&broker, "r1", "b.txt", b"again").await;
    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Pending);
    assert_eq!(slot.payload_key, key);
}

#[tokio::test]
async fn test_complete_works_in_fetch_clears_mode() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", None).await.unwrap();
    let key = send(&broker, "r1", "a.txt", b"hi").await;

    assert!(broker.complete("r1").await.unwrap());
    assert!(broker.poll("r1").await.unwrap().is_none());

    // Completed payloads are released, so a late download finds nothing
    assert!(matches!(
        broker.fetch(&key).await,
        Err(BrokerError::PayloadNotFound(_))
    ));
    let slot = broker.inspect("r1").await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Completed);
}

#[tokio::test]
async fn test_reregistration_keeps_pending_delivery() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", Some("Desk")).await.unwrap();
    let key = send(&broker, "r1", "a.txt", b"hi").await;

    let name = broker.register("r1", Some("Laptop")).await.unwrap();
    assert_eq!(name, "Laptop");

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.payload_key, key);
    assert_eq!(broker.active().await, vec!["r1".to_string()]);
}

#[tokio::test]
async fn test_opaque_instructions_round_trip() {
    let (_dir, broker) = setup(AckMode::FetchClears).await;
    broker.register("r1", None).await.unwrap();

    broker
        .intake_bytes(
            request("r1", "setup.exe", "C:\\Program Files\\..\\odd path", true),
            Some(Bytes::from_static(b"MZ")),
        )
        .await
        .unwrap();

    let slot = broker.poll("r1").await.unwrap().unwrap();
    assert_eq!(slot.target_path, "C:\\Program Files\\..\\odd path");
    assert!(slot.execute);
}
