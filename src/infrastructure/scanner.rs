use crate::config::{IngestConfig, ScanMode};
use crate::services::scanner::{VirusScanner, create_scanner};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn setup_scanner(config: &IngestConfig) -> Arc<dyn VirusScanner> {
    let scanner: Arc<dyn VirusScanner> = Arc::from(create_scanner(config));

    if config.scan_mode == ScanMode::Inline {
        if scanner.health_check().await {
            info!("🛡️  Virus scanner '{}' is reachable", config.virus_scanner_type);
        } else {
            warn!(
                "⚠️  Virus scanner '{}' at {}:{} is not responding; inline scans will fail",
                config.virus_scanner_type, config.clamav_host, config.clamav_port
            );
        }
    }

    scanner
}
