use crate::config::{IngestConfig, ScanMode};
use crate::services::bus::InMemoryBus;
use std::sync::Arc;
use tracing::{info, warn};

/// In-process bus for single-node runs.
///
/// With asynchronous scanning enabled, a local consumer is bound on the antivirus
/// route so requests are logged rather than refused for lack of a queue.
pub fn setup_bus(config: &IngestConfig) -> Arc<InMemoryBus> {
    let bus = Arc::new(InMemoryBus::new());

    if config.scan_mode == ScanMode::Async {
        let mut queue = bus.bind(&config.av_exchange, &config.av_routing_key);
        info!(
            "📬 Local scan queue bound on '{}' / '{}'",
            config.av_exchange, config.av_routing_key
        );
        tokio::spawn(async move {
            while let Some(delivery) = queue.recv().await {
                if delivery.is_expired() {
                    warn!(correlation_id = %delivery.message.correlation_id, "Dropping expired scan request");
                    continue;
                }
                info!(
                    correlation_id = %delivery.message.correlation_id,
                    payload = %delivery.message.payload,
                    "Scan request queued for an external scanner"
                );
            }
        });
    }

    bus
}
