use crate::services::rpc::RpcEnvelope;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// A message as handed to the bus
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    pub correlation_id: String,
    /// Survive broker restarts
    pub persistent: bool,
    /// Broker-side time-to-live; the message is dropped unconsumed after this
    pub expiration: Option<Duration>,
}

/// Transport seam for request/reply and fire-and-forget messaging.
///
/// `request` waits for the reply without any bound of its own; callers that need
/// bounded time go through [`crate::services::rpc::RpcGateway`].
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    async fn request(&self, message: OutboundMessage) -> Result<Value>;
}

/// A message delivered to a consumer bound on an [`InMemoryBus`] route
#[derive(Debug)]
pub struct Delivery {
    pub message: OutboundMessage,
    published_at: Instant,
    reply: Option<oneshot::Sender<Value>>,
}

impl Delivery {
    /// True once the message outlived its expiration; consumers should discard it.
    pub fn is_expired(&self) -> bool {
        self.message
            .expiration
            .is_some_and(|ttl| self.published_at.elapsed() > ttl)
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Sends the reply to the requester. A requester that already gave up is not an error.
    pub fn reply(self, body: Value) -> Result<()> {
        let sender = self
            .reply
            .ok_or_else(|| anyhow!("message {} does not expect a reply", self.message.correlation_id))?;
        if sender.send(body).is_err() {
            tracing::debug!(
                correlation_id = %self.message.correlation_id,
                "Requester stopped waiting before the reply arrived"
            );
        }
        Ok(())
    }

    pub fn reply_with<T: Serialize>(self, envelope: &RpcEnvelope<T>) -> Result<()> {
        let body = serde_json::to_value(envelope)?;
        self.reply(body)
    }
}

const QUEUE_DEPTH: usize = 64;

/// In-process bus keyed by `(exchange, routing_key)`.
///
/// Used for tests and single-node runs; broker adapters implement [`MessageBus`]
/// outside this crate.
#[derive(Default)]
pub struct InMemoryBus {
    routes: DashMap<(String, String), mpsc::Sender<Delivery>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a consumer queue to a route, replacing any previous binding.
    pub fn bind(&self, exchange: &str, routing_key: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.routes
            .insert((exchange.to_string(), routing_key.to_string()), tx);
        rx
    }

    fn route(&self, message: &OutboundMessage) -> Result<mpsc::Sender<Delivery>> {
        self.routes
            .get(&(message.exchange.clone(), message.routing_key.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                anyhow!(
                    "no queue bound to exchange '{}' with routing key '{}'",
                    message.exchange,
                    message.routing_key
                )
            })
    }

    async fn deliver(&self, message: OutboundMessage, reply: Option<oneshot::Sender<Value>>) -> Result<()> {
        let sender = self.route(&message)?;
        let exchange = message.exchange.clone();
        sender
            .send(Delivery {
                message,
                published_at: Instant::now(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("consumer on exchange '{}' is gone", exchange))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.deliver(message, None).await
    }

    async fn request(&self, message: OutboundMessage) -> Result<Value> {
        let correlation_id = message.correlation_id.clone();
        let (tx, rx) = oneshot::channel();
        self.deliver(message, Some(tx)).await?;
        rx.await
            .map_err(|_| anyhow!("reply channel for {} closed without an answer", correlation_id))
    }
}
