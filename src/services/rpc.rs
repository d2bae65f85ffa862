//! Bounded-time request/reply over the message bus.
//!
//! The caller-side wait (`timeout`) and the broker-side message lifetime
//! (`expiration`) are separate knobs. Expiration is always strictly longer than the
//! timeout so the broker never drops a request the caller is still waiting on.

use crate::services::bus::{MessageBus, OutboundMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error half of a reply envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub status: u16,
    pub message: String,
}

/// The unit exchanged over the bus for request/reply calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope<T> {
    #[serde(default)]
    pub message: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl<T> RpcEnvelope<T> {
    pub fn ok(message: T) -> Self {
        Self {
            message: Some(message),
            error: None,
        }
    }

    pub fn err(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: None,
            error: Some(RpcErrorBody {
                status,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(
        "RPC timeout: no reply from exchange '{exchange}' for routing key '{routing_key}' within {timeout_ms}ms"
    )]
    Timeout {
        exchange: String,
        routing_key: String,
        timeout_ms: u64,
    },

    #[error("RPC bad request: {0}")]
    BadRequest(String),

    #[error("RPC forbidden: {0}")]
    Forbidden(String),

    #[error("RPC unprocessable: {0}")]
    Unprocessable(String),

    #[error("RPC internal error: {0}")]
    Internal(String),

    /// A status the gateway has no mapping for, kept intact for diagnosis
    #[error("RPC internal error: unexpected reply status {}: {}", .0.status, .0.message)]
    Unexpected(RpcErrorBody),

    #[error("RPC to '{exchange}' with routing key '{routing_key}' cancelled")]
    Cancelled {
        exchange: String,
        routing_key: String,
    },

    #[error("RPC transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("RPC reply could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, RpcError::Internal(_) | RpcError::Unexpected(_))
    }

    fn from_reply(body: RpcErrorBody) -> Self {
        match body.status {
            400 => RpcError::BadRequest(body.message),
            403 => RpcError::Forbidden(body.message),
            422 => RpcError::Unprocessable(body.message),
            500 => RpcError::Internal(body.message),
            _ => RpcError::Unexpected(body),
        }
    }
}

/// Broker-side lifetime for a request waited on for `timeout`.
///
/// Returns `None` for a zero timeout (no caller bound, no expiration). Otherwise the
/// result is `ceil(timeout_ms * 1.1)` and always strictly greater than `timeout`.
pub fn expiration_for(timeout: Duration) -> Option<Duration> {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    if timeout_ms == 0 {
        return None;
    }
    let expiration_ms = timeout_ms.saturating_mul(11).saturating_add(9) / 10;
    Some(Duration::from_millis(expiration_ms.max(timeout_ms.saturating_add(1))))
}

pub struct RpcGateway {
    bus: Arc<dyn MessageBus>,
    default_timeout: Duration,
}

impl RpcGateway {
    pub fn new(bus: Arc<dyn MessageBus>, default_timeout: Duration) -> Self {
        Self {
            bus,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends `payload` to `exchange` under routing key `event` and waits up to
    /// `timeout` for the reply. `None` uses the gateway default; a zero timeout
    /// waits indefinitely.
    pub async fn request<P, T>(
        &self,
        event: &str,
        payload: &P,
        exchange: &str,
        timeout: impl Into<Option<Duration>>,
    ) -> Result<T, RpcError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request_until(event, payload, exchange, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`request`](Self::request), but gives up as soon as `cancel` fires.
    /// The bus-level message is not retracted.
    #[tracing::instrument(
        skip(self, payload, timeout, cancel),
        fields(correlation_id = tracing::field::Empty, timeout_ms = tracing::field::Empty)
    )]
    pub async fn request_until<P, T>(
        &self,
        event: &str,
        payload: &P,
        exchange: &str,
        timeout: impl Into<Option<Duration>>,
        cancel: &CancellationToken,
    ) -> Result<T, RpcError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let timeout = timeout.into().unwrap_or(self.default_timeout);
        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let message = OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: event.to_string(),
            payload: serde_json::to_value(payload)?,
            correlation_id,
            persistent: false,
            expiration: expiration_for(timeout),
        };

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::Span::current().record("timeout_ms", timeout_ms);
        let wait = async {
            if timeout.is_zero() {
                Ok(self.bus.request(message).await)
            } else {
                tokio::time::timeout(timeout, self.bus.request(message)).await
            }
        };

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(exchange, event, "RPC wait cancelled");
                return Err(RpcError::Cancelled {
                    exchange: exchange.to_string(),
                    routing_key: event.to_string(),
                });
            }
            outcome = wait => outcome,
        };

        let raw = match reply {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(RpcError::Transport(e)),
            Err(_) => {
                tracing::warn!(exchange, event, timeout_ms, "RPC reply timed out");
                return Err(RpcError::Timeout {
                    exchange: exchange.to_string(),
                    routing_key: event.to_string(),
                    timeout_ms,
                });
            }
        };

        decode_reply(raw)
    }

    /// Fire-and-forget persistent publish.
    pub async fn publish<P>(&self, event: &str, payload: &P, exchange: &str) -> Result<(), RpcError>
    where
        P: Serialize + ?Sized,
    {
        let message = OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: event.to_string(),
            payload: serde_json::to_value(payload)?,
            correlation_id: Uuid::new_v4().to_string(),
            persistent: true,
            expiration: None,
        };
        self.bus.publish(message).await.map_err(RpcError::Transport)
    }

    /// Like [`publish`](Self::publish), but stops waiting on the bus once `cancel` fires.
    pub async fn publish_until<P>(
        &self,
        event: &str,
        payload: &P,
        exchange: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError>
    where
        P: Serialize + ?Sized,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled {
                exchange: exchange.to_string(),
                routing_key: event.to_string(),
            }),
            published = self.publish(event, payload, exchange) => published,
        }
    }
}

fn decode_reply<T: DeserializeOwned>(raw: Value) -> Result<T, RpcError> {
    let envelope: RpcEnvelope<Value> = serde_json::from_value(raw)?;
    if let Some(error) = envelope.error {
        return Err(RpcError::from_reply(error));
    }
    Ok(serde_json::from_value(envelope.message.unwrap_or(Value::Null))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bus::InMemoryBus;
    use serde_json::json;

    #[test]
    fn test_expiration_exceeds_timeout() {
        for ms in [1u64, 2, 9, 10, 11, 999, 1000, 30_000, u64::MAX / 20] {
            let expiration = expiration_for(Duration::from_millis(ms)).unwrap();
            assert!(expiration > Duration::from_millis(ms), "ms={}", ms);
        }
        assert_eq!(expiration_for(Duration::from_millis(1000)), Some(Duration::from_millis(1100)));
        assert_eq!(expiration_for(Duration::ZERO), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let body = |status| RpcErrorBody {
            status,
            message: "m".into(),
        };
        assert!(matches!(RpcError::from_reply(body(400)), RpcError::BadRequest(_)));
        assert!(matches!(RpcError::from_reply(body(403)), RpcError::Forbidden(_)));
        assert!(matches!(RpcError::from_reply(body(422)), RpcError::Unprocessable(_)));
        assert!(matches!(RpcError::from_reply(body(500)), RpcError::Internal(_)));
        match RpcError::from_reply(body(999)) {
            RpcError::Unexpected(original) => assert_eq!(original.status, 999),
            other => panic!("expected wrapped error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_nullable_message() {
        let value: Option<String> = decode_reply(json!({})).unwrap();
        assert!(value.is_none());
        let err = decode_reply::<String>(json!({})).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[tokio::test]
    async fn test_request_carries_expiration() {
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.bind("files", "files.count");
        let gateway = RpcGateway::new(bus.clone(), Duration::from_secs(1));

        tokio::spawn(async move {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.message.expiration, Some(Duration::from_millis(550)));
            assert!(!delivery.message.persistent);
            delivery.reply(json!({"message": 3})).unwrap();
        });

        let count: u32 = gateway
            .request("files.count", &json!({}), "files", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_promptly() {
        let bus = Arc::new(InMemoryBus::new());
        let _rx = bus.bind("files", "files.slow");
        let gateway = RpcGateway::new(bus, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = gateway
            .request_until::<_, Value>("files.slow", &json!({}), "files", Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_timeout_uses_gateway_default() {
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.bind("files", "files.count");
        let gateway = RpcGateway::new(bus.clone(), Duration::from_millis(2000));

        tokio::spawn(async move {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.message.expiration, Some(Duration::from_millis(2200)));
            delivery.reply(json!({"message": 1})).unwrap();
        });

        let count: u32 = gateway
            .request("files.count", &json!({}), "files", None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_publish_sends_nothing() {
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.bind("av", "scan");
        let gateway = RpcGateway::new(bus, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway
            .publish_until("scan", &json!({}), "av", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
        assert!(rx.try_recv().is_err());
    }
}
