//! Integration tests for the broker to internal bus bridge
//!
//! These tests drive the full proxy against a mock broker transport and an
//! in-memory bus:
//! - Category forwarding and wire format on the bus
//! - Per-message error isolation (decode, adjust, publish)
//! - Downlink requests from the bus to the broker
//! - Reconnect with subscription replay
//! - Shutdown

use lorabridge_core::{BrokerDevice, Category, LoraMessage, SimpleMessage};
use lorabridge_mqtt::test_utils::{envelopes, wait_until};
use lorabridge_mqtt::{
    BridgeConfig, BridgeConfigBuilder, BridgeError, BridgeProxy, BrokerClient, ConnectConfig,
    ConnectionState, IdentityAdjuster, MemoryBus, MockTransport, PayloadAdjuster, ProxyHandle,
    TtnV3,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const UPLINK: &str = "v3/my-app@ttn/devices/dev-1/up";

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    transport: Arc<MockTransport>,
    bus: Arc<MemoryBus>,
    client: BrokerClient,
    handle: ProxyHandle,
}

fn config() -> BridgeConfigBuilder {
    BridgeConfigBuilder::new()
        .broker_address("mqtt://localhost")
        .application("my-app", "key")
        .bus_topic(Category::Join, "joins")
        .bus_topic(Category::Uplink, "uplinks")
        .bus_topic(Category::UplinkError, "uplink-errors")
        .bus_topic(Category::DownlinkSent, "downlink-receipts")
        .bus_topic(Category::DownlinkFailed, "downlink-errors")
        .downlinks("downlink-requests")
}

async fn start(config: BridgeConfig, adjuster: Arc<dyn PayloadAdjuster>) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let bus = Arc::new(MemoryBus::new());
    let client = BrokerClient::new(transport.clone(), &config.connect).unwrap();

    let mut proxy = BridgeProxy::new(
        client.clone(),
        Arc::new(TtnV3::new("my-app")),
        adjuster,
        bus.clone(),
        &config,
    );
    proxy.initialize().await.unwrap();
    let handle = proxy.run().await.unwrap();

    Harness {
        transport,
        bus,
        client,
        handle,
    }
}

async fn start_default() -> Harness {
    start(config().build(), Arc::new(IdentityAdjuster)).await
}

fn downlink_request(source: &str, device: &str, payload: Vec<u8>) -> Vec<u8> {
    SimpleMessage::new(BrokerDevice::new(source, device), payload)
        .to_json()
        .unwrap()
}

// ============================================================================
// Broker → Bus
// ============================================================================

#[tokio::test]
async fn test_uplink_forwarded_with_enrichment() {
    let h = start_default().await;

    let acks = h
        .transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;

    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
    let published = &h.bus.published_on("uplinks")[0];
    let lora = LoraMessage::from_json(published).unwrap();
    assert_eq!(lora.device_uid(), "dev-1");
    assert_eq!(lora.message.source(), "my-app");
    assert_eq!(lora.payload(), &[0xDE, 0xDE]);
    assert_eq!(lora.signal.unwrap().rssi, -80);
    assert_eq!(lora.location.unwrap().altitude, 3.0);

    let json: serde_json::Value = serde_json::from_slice(published).unwrap();
    assert_eq!(json["Payload"], "3t4=");
    assert_eq!(json["DeviceUID"], "dev-1");

    assert_eq!(acks.load(Ordering::SeqCst), 1);
    let stats = h.handle.stats();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.forwarded, 1);
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test]
async fn test_uplink_without_metadata_omits_enrichment() {
    let h = start_default().await;

    h.transport
        .inject(UPLINK, envelopes::uplink_without_metadata("dev-1", "AQ=="))
        .await;

    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
    let json: serde_json::Value =
        serde_json::from_slice(&h.bus.published_on("uplinks")[0]).unwrap();
    assert!(json.get("Signal").is_none());
    assert!(json.get("Location").is_none());
}

#[tokio::test]
async fn test_malformed_message_is_acked_and_dropped() {
    let h = start_default().await;

    let bad = h.transport.inject(UPLINK, b"{not json".to_vec()).await;
    let good = h
        .transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;

    wait_until(|| good.load(Ordering::SeqCst) == 1).await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
    assert_eq!(bad.load(Ordering::SeqCst), 1);

    let stats = h.handle.stats();
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.forwarded, 1);
}

#[tokio::test]
async fn test_adjustment_failure_still_forwards() {
    let failing = |_: &mut LoraMessage| -> lorabridge_mqtt::Result<()> {
        Err(BridgeError::Adjustment("unknown segment layout".to_string()))
    };
    let h = start(config().build(), Arc::new(failing)).await;

    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;

    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
    let lora = LoraMessage::from_json(&h.bus.published_on("uplinks")[0]).unwrap();
    assert_eq!(lora.payload(), &[0xDE, 0xDE]);
    assert_eq!(h.handle.stats().adjust_errors, 1);
}

#[tokio::test]
async fn test_adjuster_applies_to_uplinks_only() {
    let truncate = |m: &mut LoraMessage| -> lorabridge_mqtt::Result<()> {
        m.payload_mut().truncate(1);
        Ok(())
    };
    let h = start(config().build(), Arc::new(truncate)).await;

    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;
    h.transport
        .inject(
            "v3/my-app@ttn/devices/dev-1/down/sent",
            envelopes::downlink_event("dev-1", "sent", "AAI="),
        )
        .await;

    wait_until(|| h.bus.published_on("downlink-receipts").len() == 1).await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;

    let uplink = LoraMessage::from_json(&h.bus.published_on("uplinks")[0]).unwrap();
    assert_eq!(uplink.payload(), &[0xDE]);
    let receipt = SimpleMessage::from_json(&h.bus.published_on("downlink-receipts")[0]).unwrap();
    assert_eq!(receipt.payload, vec![0, 2]);
}

#[tokio::test]
async fn test_bus_failure_is_logged_not_retried() {
    let h = start_default().await;
    h.bus.set_failing(true);

    let acks = h
        .transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;

    wait_until(|| h.handle.stats().publish_errors == 1).await;
    assert_eq!(acks.load(Ordering::SeqCst), 1);
    assert!(h.bus.published().is_empty());

    // The loop keeps going once the bus recovers
    h.bus.set_failing(false);
    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
}

#[tokio::test]
async fn test_failed_ack_still_forwards_and_continues() {
    let h = start_default().await;

    h.transport
        .inject_unackable(UPLINK, envelopes::uplink("dev-1", "AQ=="))
        .await;
    let acks = h
        .transport
        .inject(UPLINK, envelopes::uplink("dev-1", "Ag=="))
        .await;

    wait_until(|| h.bus.published_on("uplinks").len() == 2).await;
    assert_eq!(acks.load(Ordering::SeqCst), 1);
    let stats = h.handle.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.acknowledged, 1);
}

#[tokio::test]
async fn test_order_preserved_within_category() {
    let h = start_default().await;

    for i in 0..20u8 {
        let payload = base64_byte(i);
        h.transport
            .inject(UPLINK, envelopes::uplink("dev-1", &payload))
            .await;
    }

    wait_until(|| h.bus.published_on("uplinks").len() == 20).await;
    let payloads: Vec<u8> = h
        .bus
        .published_on("uplinks")
        .iter()
        .map(|data| LoraMessage::from_json(data).unwrap().payload()[0])
        .collect();
    assert_eq!(payloads, (0..20u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_stalled_bus_holds_messages_without_dropping() {
    let h = start(
        config().channel_capacity(1).build(),
        Arc::new(IdentityAdjuster),
    )
    .await;
    h.bus.set_publish_delay(Duration::from_millis(20));

    // Well past the one queued and one in-flight message the loop can hold
    let count = 8u8;
    let mut acks = Vec::new();
    for i in 0..count {
        let payload = base64_byte(i);
        acks.push(
            h.transport
                .inject(UPLINK, envelopes::uplink("dev-1", &payload))
                .await,
        );
    }

    wait_until(|| h.bus.published_on("uplinks").len() == usize::from(count)).await;
    let payloads: Vec<u8> = h
        .bus
        .published_on("uplinks")
        .iter()
        .map(|data| LoraMessage::from_json(data).unwrap().payload()[0])
        .collect();
    assert_eq!(payloads, (0..count).collect::<Vec<_>>());
    wait_until(|| acks.iter().all(|a| a.load(Ordering::SeqCst) == 1)).await;
}

fn base64_byte(b: u8) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode([b])
}

#[tokio::test]
async fn test_categories_routed_to_bus_topics() {
    let h = start_default().await;

    h.transport
        .inject("v3/my-app@ttn/devices/dev-1/join", envelopes::join("dev-1"))
        .await;
    h.transport
        .inject(
            "v3/my-app@ttn/devices/dev-1/down/failed",
            envelopes::downlink_event("dev-1", "failed", "AAI="),
        )
        .await;
    h.transport
        .inject(
            "v3/my-app@ttn/devices/dev-1/down/queued",
            envelopes::downlink_event("dev-1", "queued", "AAI="),
        )
        .await;

    wait_until(|| h.bus.published_on("joins").len() == 1).await;
    wait_until(|| h.bus.published_on("downlink-errors").len() == 1).await;
    wait_until(|| h.bus.published_on("downlink-receipts").len() == 1).await;

    let join = SimpleMessage::from_json(&h.bus.published_on("joins")[0]).unwrap();
    assert_eq!(join.device_uid(), "dev-1");
}

#[tokio::test]
async fn test_uplink_error_forwarded_as_raw_event() {
    let h = start_default().await;
    let raw = envelopes::uplink_error("dev-9");

    let acks = h
        .transport
        .inject("v3/my-app@ttn/devices/dev-9/events/up/error", raw.clone())
        .await;

    wait_until(|| h.bus.published_on("uplink-errors").len() == 1).await;
    let message = SimpleMessage::from_json(&h.bus.published_on("uplink-errors")[0]).unwrap();
    assert_eq!(message.device_uid(), "dev-9");
    assert_eq!(message.payload, raw);
    assert_eq!(acks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unconfigured_bus_topic_is_acked() {
    let config = BridgeConfigBuilder::new()
        .application("my-app", "key")
        .bus_topic(Category::Uplink, "uplinks")
        .build();
    let h = start(config, Arc::new(IdentityAdjuster)).await;

    let acks = h
        .transport
        .inject("v3/my-app@ttn/devices/dev-1/join", envelopes::join("dev-1"))
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert!(h.bus.published().is_empty());
    assert!(!h.handle.accepts_downlinks());
}

// ============================================================================
// Bus → Broker (downlinks)
// ============================================================================

#[tokio::test]
async fn test_downlink_request_published_to_replace_topic() {
    let h = start_default().await;
    assert!(h.handle.accepts_downlinks());

    let acks = h
        .bus
        .deliver(
            "downlink-requests",
            downlink_request("my-app", "dev-1", vec![0x00, 0x02]),
        )
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    let (topic, payload) = &published[0];
    assert_eq!(topic, "v3/my-app@ttn/devices/dev-1/down/replace");

    let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
    let downlink = &json["downlinks"][0];
    assert_eq!(downlink["frm_payload"], "AAI=");
    assert_eq!(downlink["f_port"], 15);
    assert_eq!(downlink["priority"], "HIGH");
    assert_eq!(downlink["confirmed"], true);
    let correlation = downlink["correlation_ids"][0].as_str().unwrap();
    assert!(correlation.starts_with("dev-1-"));
    assert!(correlation["dev-1-".len()..].parse::<i64>().is_ok());

    assert_eq!(h.handle.stats().downlinks_sent, 1);
}

#[tokio::test]
async fn test_downlink_source_mismatch_still_sent() {
    let h = start_default().await;

    let acks = h
        .bus
        .deliver(
            "downlink-requests",
            downlink_request("other-app", "dev-2", vec![1]),
        )
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert_eq!(h.transport.published().len(), 1);
    let stats = h.handle.stats();
    assert_eq!(stats.source_mismatches, 1);
    assert_eq!(stats.downlinks_sent, 1);
}

#[tokio::test]
async fn test_invalid_downlink_request_is_acked() {
    let h = start_default().await;

    let acks = h
        .bus
        .deliver("downlink-requests", b"garbage".to_vec())
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert!(h.transport.published().is_empty());
    assert_eq!(h.handle.stats().downlink_errors, 1);
}

#[tokio::test]
async fn test_downlink_broker_rejection_is_acked() {
    let h = start_default().await;
    h.transport
        .fail_publish("v3/my-app@ttn/devices/dev-1/down/replace");

    let acks = h
        .bus
        .deliver(
            "downlink-requests",
            downlink_request("my-app", "dev-1", vec![1]),
        )
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert_eq!(h.handle.stats().downlink_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_downlink_publish_times_out() {
    let h = start_default().await;
    h.transport.set_publish_delay(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    let acks = h
        .bus
        .deliver(
            "downlink-requests",
            downlink_request("my-app", "dev-1", vec![1]),
        )
        .await;

    wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.handle.stats().downlink_errors, 1);
}

// ============================================================================
// Connection resilience
// ============================================================================

#[tokio::test]
async fn test_reconnect_replays_subscriptions_and_resumes() {
    let h = start_default().await;
    let before = h.transport.subscribed_topics();
    h.transport.clear_calls();

    h.transport.drop_connection("broker restarted").await;
    wait_until(|| h.client.state() == ConnectionState::Reconnecting).await;
    h.transport.restore_connection().await;
    wait_until(|| h.client.is_connected()).await;

    let mut replayed = h.transport.subscribed_topics();
    let mut expected = before;
    replayed.sort();
    expected.sort();
    assert_eq!(replayed, expected);

    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_zero_retries_fails_fast() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_connects(1);
    let connect = ConnectConfig {
        retries: 0,
        ..ConnectConfig::default()
    };
    let client = BrokerClient::new(transport, &connect).unwrap();

    let started = tokio::time::Instant::now();
    let err = client.connect().await.unwrap_err();

    assert!(matches!(err, BridgeError::Connection(_)));
    assert!(started.elapsed() <= connect.retry_delay);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_stops_forwarding_loops() {
    let h = start_default().await;
    assert_eq!(h.handle.active_loops(), Category::DEFAULT_INBOUND.len());

    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;

    h.handle.shutdown().await.unwrap();

    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(h.client.topics().is_empty());
    assert_eq!(h.transport.disconnects(), 1);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_deployment_config_drives_proxy() {
    let dir = std::env::temp_dir().join(format!("lorabridge-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = BridgeConfig::deployment_path(&dir, "staging");
    std::fs::write(
        &path,
        r#"{
            "broker": {"address": "mqtts://eu1.cloud.thethings.network", "app_id": "my-app", "app_key": "NNSXS.KEY"},
            "connect": {"retries": 2, "retry_delay": "100ms"},
            "proxy": {"categories": ["uplink"], "channel_capacity": 4},
            "bus": {"uplinks": "uplinks"}
        }"#,
    )
    .unwrap();

    let config = BridgeConfig::for_deployment(&dir, "staging").unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
    config.validate().unwrap();
    assert_eq!(config.connect.retry_delay, Duration::from_millis(100));
    assert_eq!(config.broker.username("ttn"), "my-app@ttn");

    let h = start(config, Arc::new(IdentityAdjuster)).await;
    assert_eq!(h.transport.subscribed_topics(), vec!["v3/my-app@ttn/devices/+/up"]);
    assert!(!h.handle.accepts_downlinks());

    h.transport
        .inject(UPLINK, envelopes::uplink("dev-1", "3t4="))
        .await;
    wait_until(|| h.bus.published_on("uplinks").len() == 1).await;
}
