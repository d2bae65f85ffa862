use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// How uploaded bytes are handed to the antivirus service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Stream a branch of the upload to the scanning engine in-process
    Inline,
    /// Publish a scan request referencing the stored object
    Async,
    /// Skip scanning entirely
    Disabled,
}

impl ScanMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "inline" | "sync" => Some(ScanMode::Inline),
            "async" | "queue" => Some(ScanMode::Async),
            "disabled" | "none" | "off" => Some(ScanMode::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Process-wide upload deadline in milliseconds (default: 60000)
    pub upload_timeout_ms: u64,

    /// Per-route deadline overrides, keyed by route path
    pub route_timeouts: HashMap<String, u64>,

    /// Time between deadline expiry and forced connection termination (default: 2000)
    pub deadline_grace_ms: u64,

    /// Maximum accepted upload size in bytes (default: 1 GB)
    pub max_file_size: usize,

    /// Antivirus hand-off mode (default: async)
    pub scan_mode: ScanMode,

    /// Virus scanner type for inline mode: "clamav" or "noop" (default: "clamav")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// Exchange the asynchronous scan request is published to
    pub av_exchange: String,

    /// Routing key for the asynchronous scan request
    pub av_routing_key: String,

    /// Public base address used to build download and callback URLs
    pub service_base_url: String,

    /// HMAC secret for correlation tokens
    pub callback_token_secret: String,

    /// Lifetime of a correlation token in seconds (default: 24h)
    pub callback_token_ttl_secs: u64,

    /// Sliding window for duplicate submission detection (default: 30s)
    pub duplicate_window_secs: u64,

    /// User-agent families known to replay uploads on timeout
    pub retry_prone_agents: Vec<String>,

    /// Upper bound on the age of an upload session entry (default: 15 min)
    pub session_ttl_secs: u64,

    /// Maximum number of tracked upload sessions (default: 10000)
    pub session_capacity: usize,

    /// Chunks buffered per fan-out branch before the source is paused (default: 8)
    pub branch_buffer_chunks: usize,

    /// Default wait for RPC replies in milliseconds (default: 10000)
    pub rpc_default_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_timeout_ms: 60_000,
            route_timeouts: HashMap::new(),
            deadline_grace_ms: 2_000,
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            scan_mode: ScanMode::Async,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            av_exchange: "antivirus".to_string(),
            av_routing_key: "antivirus.scan.request".to_string(),
            service_base_url: "http://localhost:3000".to_string(),
            callback_token_secret: "secret".to_string(),
            callback_token_ttl_secs: 24 * 3600,
            duplicate_window_secs: 30,
            retry_prone_agents: vec!["chromium".to_string()],
            session_ttl_secs: 15 * 60,
            session_capacity: 10_000,
            branch_buffer_chunks: 8,
            rpc_default_timeout_ms: 10_000,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parses `route=ms,route=ms` into a lookup table. Malformed pairs are kept with a
/// zero value so that `validate` rejects them instead of silently dropping them.
pub fn parse_route_timeouts(raw: &str) -> HashMap<String, u64> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((route, ms)) => (route.trim().to_string(), parse_timeout_ms(Some(ms), 0)),
            None => (pair.to_string(), 0),
        })
        .collect()
}

/// A timeout in milliseconds. An unset value takes `default`; a value that is set
/// but not a number becomes zero so that `validate` rejects it.
pub fn parse_timeout_ms(raw: Option<&str>, default: u64) -> u64 {
    match raw {
        Some(value) => value.trim().parse().unwrap_or(0),
        None => default,
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            upload_timeout_ms: parse_timeout_ms(
                env::var("UPLOAD_TIMEOUT_MS").ok().as_deref(),
                default.upload_timeout_ms,
            ),

            route_timeouts: env::var("ROUTE_TIMEOUTS")
                .map(|v| parse_route_timeouts(&v))
                .unwrap_or(default.route_timeouts),

            deadline_grace_ms: parsed("DEADLINE_GRACE_MS").unwrap_or(default.deadline_grace_ms),

            max_file_size: parsed("MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            scan_mode: env::var("SCAN_MODE")
                .ok()
                .and_then(|v| ScanMode::parse(&v))
                .unwrap_or(default.scan_mode),

            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),

            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),

            clamav_port: parsed("CLAMAV_PORT").unwrap_or(default.clamav_port),

            av_exchange: env::var("AV_EXCHANGE").unwrap_or(default.av_exchange),

            av_routing_key: env::var("AV_ROUTING_KEY").unwrap_or(default.av_routing_key),

            service_base_url: env::var("SERVICE_BASE_URL").unwrap_or(default.service_base_url),

            callback_token_secret: env::var("CALLBACK_TOKEN_SECRET")
                .unwrap_or(default.callback_token_secret),

            callback_token_ttl_secs: parsed("CALLBACK_TOKEN_TTL_SECS")
                .unwrap_or(default.callback_token_ttl_secs),

            duplicate_window_secs: parsed("DUPLICATE_WINDOW_SECS")
                .unwrap_or(default.duplicate_window_secs),

            retry_prone_agents: env::var("RETRY_PRONE_AGENTS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.retry_prone_agents),

            session_ttl_secs: parsed("SESSION_TTL_SECS").unwrap_or(default.session_ttl_secs),

            session_capacity: parsed("SESSION_CAPACITY").unwrap_or(default.session_capacity),

            branch_buffer_chunks: parsed("BRANCH_BUFFER_CHUNKS")
                .unwrap_or(default.branch_buffer_chunks),

            rpc_default_timeout_ms: parsed("RPC_DEFAULT_TIMEOUT_MS")
                .unwrap_or(default.rpc_default_timeout_ms),
        }
    }

    /// Create config for development (inline no-op scanning, short windows)
    pub fn development() -> Self {
        Self {
            scan_mode: ScanMode::Inline,
            virus_scanner_type: "noop".to_string(),
            session_ttl_secs: 60,
            ..Self::default()
        }
    }

    /// Create config for production (strict security)
    pub fn production() -> Self {
        let mut config = Self::from_env();
        config.callback_token_secret =
            env::var("CALLBACK_TOKEN_SECRET").expect("CRITICAL: CALLBACK_TOKEN_SECRET must be set");
        config
    }

    /// Checks the invariants the pipeline relies on at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "UPLOAD_TIMEOUT_MS",
                reason: "must be a positive number of milliseconds".to_string(),
            });
        }
        if let Some((route, _)) = self.route_timeouts.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigError::Invalid {
                key: "ROUTE_TIMEOUTS",
                reason: format!("route '{}' has no positive timeout", route),
            });
        }
        if self.session_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "SESSION_CAPACITY",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.branch_buffer_chunks == 0 {
            return Err(ConfigError::Invalid {
                key: "BRANCH_BUFFER_CHUNKS",
                reason: "must be at least 1".to_string(),
            });
        }
        if url::Url::parse(&self.service_base_url).is_err() {
            return Err(ConfigError::Invalid {
                key: "SERVICE_BASE_URL",
                reason: format!("'{}' is not an absolute URL", self.service_base_url),
            });
        }
        Ok(())
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn deadline_grace(&self) -> Duration {
        Duration::from_millis(self.deadline_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.upload_timeout_ms, 60_000);
        assert_eq!(config.scan_mode, ScanMode::Async);
        assert_eq!(config.duplicate_window_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = IngestConfig::development();
        assert_eq!(config.scan_mode, ScanMode::Inline);
        assert_eq!(config.virus_scanner_type, "noop");
    }

    #[test]
    fn test_parse_route_timeouts() {
        let routes = parse_route_timeouts("/upload/*path=120000, /avatar = 5000,broken");
        assert_eq!(routes.get("/upload/*path"), Some(&120_000));
        assert_eq!(routes.get("/avatar"), Some(&5_000));
        // Kept so that validation refuses to start
        assert_eq!(routes.get("broken"), Some(&0));
        assert_eq!(routes.len(), 3);
    }

    #[test]
    fn test_validate_rejects_pair_without_value() {
        let config = IngestConfig {
            route_timeouts: parse_route_timeouts("/upload/*path 5000"),
            ..IngestConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "ROUTE_TIMEOUTS", .. })
        ));
    }

    #[test]
    fn test_malformed_default_timeout_fails_closed() {
        assert_eq!(parse_timeout_ms(None, 60_000), 60_000);
        assert_eq!(parse_timeout_ms(Some(" 1500 "), 60_000), 1_500);

        let config = IngestConfig {
            upload_timeout_ms: parse_timeout_ms(Some("abc"), 60_000),
            ..IngestConfig::default()
        };
        assert_eq!(config.upload_timeout_ms, 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "UPLOAD_TIMEOUT_MS", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_positive_route_timeout() {
        let mut config = IngestConfig::default();
        config.route_timeouts = parse_route_timeouts("/upload=abc");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "ROUTE_TIMEOUTS", .. })
        ));
    }

    #[test]
    fn test_scan_mode_parse() {
        assert_eq!(ScanMode::parse("INLINE"), Some(ScanMode::Inline));
        assert_eq!(ScanMode::parse("async"), Some(ScanMode::Async));
        assert_eq!(ScanMode::parse("off"), Some(ScanMode::Disabled));
        assert_eq!(ScanMode::parse("maybe"), None);
    }
}
