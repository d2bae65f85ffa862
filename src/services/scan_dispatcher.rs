use crate::api::error::AppError;
use crate::config::{IngestConfig, ScanMode};
use crate::services::rpc::RpcGateway;
use crate::services::scanner::{ScanOutcome, ScanReader, VirusScanner};
use crate::utils::token::{CallbackTokens, CallbackUrls, CorrelationToken};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DISPATCHER: &str = "ScanRequestDispatcher";

/// Message published for the out-of-band scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub download_uri: String,
    pub callback_uri: String,
}

impl From<CallbackUrls> for ScanRequest {
    fn from(urls: CallbackUrls) -> Self {
        Self {
            download_uri: urls.download_uri,
            callback_uri: urls.callback_uri,
        }
    }
}

/// Hands uploads to antivirus, either in-process or through the bus
pub struct ScanRequestDispatcher {
    mode: ScanMode,
    scanner: Arc<dyn VirusScanner>,
    gateway: Arc<RpcGateway>,
    tokens: CallbackTokens,
    base_url: String,
    exchange: String,
    routing_key: String,
}

impl ScanRequestDispatcher {
    pub fn new(config: &IngestConfig, scanner: Arc<dyn VirusScanner>, gateway: Arc<RpcGateway>) -> Self {
        Self {
            mode: config.scan_mode,
            scanner,
            gateway,
            tokens: CallbackTokens::new(
                config.callback_token_secret.clone(),
                config.callback_token_ttl_secs,
            ),
            base_url: config.service_base_url.clone(),
            exchange: config.av_exchange.clone(),
            routing_key: config.av_routing_key.clone(),
        }
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn scanner(&self) -> &Arc<dyn VirusScanner> {
        &self.scanner
    }

    /// Runs the engine against `reader`. An undetermined verdict is a successful
    /// outcome with `detected == None`; only engine or transport faults are errors.
    pub async fn scan_inline(&self, reader: ScanReader) -> Result<ScanOutcome, AppError> {
        let result = self.scanner.scan(reader).await.map_err(|e| {
            tracing::error!("[{}] scan engine failure: {:#}", DISPATCHER, e);
            AppError::Internal(format!("[{}] scan engine failure: {}", DISPATCHER, e))
        })?;

        let outcome = ScanOutcome::from(result);
        match (&outcome.detected, &outcome.signature, &outcome.error) {
            (Some(true), Some(signature), _) => {
                tracing::warn!("🦠 Malware detected: {}", signature)
            }
            (None, _, Some(reason)) => {
                tracing::warn!("Scan engine could not reach a verdict: {}", reason)
            }
            _ => tracing::debug!("Inline scan clean"),
        }
        Ok(outcome)
    }

    /// Issues the correlation token for an object about to be scanned out of band.
    /// `None` when asynchronous scanning is not configured.
    pub fn correlation_token(&self, subject: &str) -> Result<Option<CorrelationToken>, AppError> {
        if self.mode != ScanMode::Async {
            return Ok(None);
        }
        self.tokens
            .issue(subject)
            .map(Some)
            .map_err(|e| AppError::Internal(format!("[{}] could not issue token: {}", DISPATCHER, e)))
    }

    /// Publishes one persistent `{download_uri, callback_uri}` message. Resolves
    /// without publishing when asynchronous scanning is off or there is no token.
    /// Returns whether a request was published. Gives up once `cancel` fires.
    pub async fn dispatch(
        &self,
        token: Option<&CorrelationToken>,
        cancel: &CancellationToken,
    ) -> Result<bool, AppError> {
        if self.mode != ScanMode::Async {
            tracing::debug!("Async scan dispatch disabled, skipping");
            return Ok(false);
        }
        let Some(token) = token else {
            tracing::debug!("No correlation token, skipping scan dispatch");
            return Ok(false);
        };

        let request = CallbackUrls::build(&self.base_url, token)
            .map(ScanRequest::from)
            .map_err(|e| AppError::Internal(format!("[{}] {}", DISPATCHER, e)))?;

        self.gateway
            .publish_until(&self.routing_key, &request, &self.exchange, cancel)
            .await
            .map_err(|e| {
                tracing::error!(exchange = %self.exchange, routing_key = %self.routing_key, "[{}] publish failed: {}", DISPATCHER, e);
                AppError::Internal(format!("[{}] failed to publish scan request: {}", DISPATCHER, e))
            })?;

        tracing::info!(exchange = %self.exchange, routing_key = %self.routing_key, "📨 Scan request published");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bus::InMemoryBus;
    use crate::services::scanner::{NoOpScanner, ScanResult};
    use std::time::Duration;

    struct Undecided;

    #[async_trait::async_trait]
    impl VirusScanner for Undecided {
        async fn scan(&self, _reader: ScanReader) -> anyhow::Result<ScanResult> {
            Ok(ScanResult::Undetermined {
                reason: "engine busy".into(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl VirusScanner for Broken {
        async fn scan(&self, _reader: ScanReader) -> anyhow::Result<ScanResult> {
            Err(anyhow::anyhow!("connection refused"))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    fn dispatcher(mode: ScanMode, scanner: Arc<dyn VirusScanner>, bus: Arc<InMemoryBus>) -> ScanRequestDispatcher {
        let config = IngestConfig {
            scan_mode: mode,
            ..IngestConfig::default()
        };
        let gateway = Arc::new(RpcGateway::new(bus, Duration::from_secs(1)));
        ScanRequestDispatcher::new(&config, scanner, gateway)
    }

    fn reader(data: &'static [u8]) -> ScanReader {
        Box::pin(std::io::Cursor::new(data))
    }

    #[tokio::test]
    async fn test_undetermined_is_not_an_error() {
        let d = dispatcher(ScanMode::Inline, Arc::new(Undecided), Arc::new(InMemoryBus::new()));
        let outcome = d.scan_inline(reader(b"data")).await.unwrap();
        assert_eq!(outcome.detected, None);
        assert_eq!(outcome.error.as_deref(), Some("engine busy"));
    }

    #[tokio::test]
    async fn test_engine_fault_is_internal() {
        let d = dispatcher(ScanMode::Inline, Arc::new(Broken), Arc::new(InMemoryBus::new()));
        match d.scan_inline(reader(b"data")).await {
            Err(AppError::Internal(msg)) => assert!(msg.contains(DISPATCHER)),
            other => panic!("expected internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_persistent_request() {
        let bus = Arc::new(InMemoryBus::new());
        let mut rx = bus.bind("antivirus", "antivirus.scan.request");
        let d = dispatcher(ScanMode::Async, Arc::new(NoOpScanner), bus);

        let token = d.correlation_token("uploads/a.pdf").unwrap();
        assert!(d.dispatch(token.as_ref(), &CancellationToken::new()).await.unwrap());

        let delivery = rx.recv().await.unwrap();
        assert!(delivery.message.persistent);
        let request: ScanRequest = serde_json::from_value(delivery.message.payload).unwrap();
        let token = token.unwrap();
        assert_eq!(
            request.download_uri,
            format!("http://localhost:3000/files/{}/download", token.as_str())
        );
        assert!(request.callback_uri.ends_with("/scan-result"));
    }

    #[tokio::test]
    async fn test_dispatch_without_token_is_noop() {
        let bus = Arc::new(InMemoryBus::new());
        let d = dispatcher(ScanMode::Async, Arc::new(NoOpScanner), bus);
        assert!(!d.dispatch(None, &CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_failure_is_tagged() {
        // Nothing bound on the route
        let d = dispatcher(ScanMode::Async, Arc::new(NoOpScanner), Arc::new(InMemoryBus::new()));
        let token = CorrelationToken::from("t".to_string());
        match d.dispatch(Some(&token), &CancellationToken::new()).await {
            Err(AppError::Internal(msg)) => assert!(msg.starts_with("[ScanRequestDispatcher]")),
            other => panic!("expected internal error, got {:?}", other),
        }
    }
}
