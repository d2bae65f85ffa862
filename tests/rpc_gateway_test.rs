use rust_file_ingest::api::error::AppError;
use rust_file_ingest::services::bus::InMemoryBus;
use rust_file_ingest::services::rpc::{RpcEnvelope, RpcError, RpcGateway};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Quota {
    used: u64,
    limit: u64,
}

fn gateway() -> (Arc<InMemoryBus>, RpcGateway) {
    let bus = Arc::new(InMemoryBus::new());
    let gateway = RpcGateway::new(bus.clone(), Duration::from_secs(10));
    (bus, gateway)
}

/// Replies to the first request on the route with `envelope`
fn reply_once(bus: &InMemoryBus, exchange: &str, event: &str, envelope: RpcEnvelope<Value>) {
    let mut queue = bus.bind(exchange, event);
    tokio::spawn(async move {
        let delivery = queue.recv().await.expect("request delivered");
        delivery.reply_with(&envelope).expect("reply sent");
    });
}

#[tokio::test]
async fn test_timeout_names_exchange_and_routing_key() {
    let (bus, gateway) = gateway();
    // Bound but never answered
    let _queue = bus.bind("test-exchange", "test-event");

    let started = Instant::now();
    let err = gateway
        .request::<_, Value>("test-event", &json!({"ping": true}), "test-exchange", Duration::from_millis(1000))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(err.is_timeout());
    let message = err.to_string();
    assert!(message.contains("test-exchange"), "{}", message);
    assert!(message.contains("test-event"), "{}", message);
    assert!(message.to_lowercase().contains("timeout"), "{}", message);

    // Distinct from an application error at the HTTP edge
    assert!(matches!(AppError::from(err), AppError::UpstreamTimeout(_)));
}

#[tokio::test]
async fn test_successful_reply_is_decoded() {
    let (bus, gateway) = gateway();
    reply_once(
        &bus,
        "quota",
        "quota.get",
        RpcEnvelope::ok(json!({"used": 10, "limit": 100})),
    );

    let quota: Quota = gateway
        .request("quota.get", &json!({"user": "u-1"}), "quota", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(quota, Quota { used: 10, limit: 100 });
}

#[tokio::test]
async fn test_forbidden_reply() {
    let (bus, gateway) = gateway();
    reply_once(&bus, "acl", "acl.check", RpcEnvelope::err(403, "not yours"));

    let err = gateway
        .request::<_, Value>("acl.check", &json!({}), "acl", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Forbidden(ref m) if m == "not yours"));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn test_unprocessable_reply() {
    let (bus, gateway) = gateway();
    reply_once(&bus, "acl", "acl.check", RpcEnvelope::err(422, "bad shape"));

    let err = gateway
        .request::<_, Value>("acl.check", &json!({}), "acl", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Unprocessable(_)));
}

#[tokio::test]
async fn test_unknown_status_is_internal_and_keeps_original() {
    let (bus, gateway) = gateway();
    reply_once(&bus, "acl", "acl.check", RpcEnvelope::err(999, "teapot overflow"));

    let err = gateway
        .request::<_, Value>("acl.check", &json!({}), "acl", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_internal());
    match &err {
        RpcError::Unexpected(original) => {
            assert_eq!(original.status, 999);
            assert_eq!(original.message, "teapot overflow");
        }
        other => panic!("expected wrapped error, got {:?}", other),
    }
    assert!(matches!(AppError::from(err), AppError::Internal(_)));
}

#[tokio::test]
async fn test_zero_timeout_waits_without_expiration() {
    let (bus, gateway) = gateway();
    let mut queue = bus.bind("slow", "slow.job");
    tokio::spawn(async move {
        let delivery = queue.recv().await.unwrap();
        assert_eq!(delivery.message.expiration, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        delivery.reply_with(&RpcEnvelope::ok(json!("done"))).unwrap();
    });

    let value: String = gateway
        .request("slow.job", &json!({}), "slow", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(value, "done");
}

#[tokio::test]
async fn test_unbound_route_is_transport_failure() {
    let (_bus, gateway) = gateway();
    let err = gateway
        .request::<_, Value>("nobody.home", &json!({}), "void", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)));
}
