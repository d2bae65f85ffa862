use crate::config::IngestConfig;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Raw engine answer for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// No threats detected
    Clean,
    /// One or more signatures matched
    Infected { signatures: Vec<String> },
    /// The engine ran but could not reach a verdict
    Undetermined { reason: String },
}

/// Inline scan outcome handed back to the ingestion path.
///
/// `detected == None` is a valid "could not tell" answer and must not be read as clean.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ScanResult> for ScanOutcome {
    fn from(result: ScanResult) -> Self {
        match result {
            ScanResult::Clean => ScanOutcome {
                detected: Some(false),
                ..Default::default()
            },
            ScanResult::Infected { signatures } => ScanOutcome {
                detected: Some(true),
                signature: Some(signatures.join(", ")),
                error: None,
            },
            ScanResult::Undetermined { reason } => ScanOutcome {
                detected: None,
                signature: None,
                error: Some(reason),
            },
        }
    }
}

/// Where an object stands with respect to antivirus inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanVerdict {
    Pending,
    Verified,
    Blocked,
    Error,
    WontCheck,
}

impl ScanVerdict {
    pub fn from_outcome(outcome: &ScanOutcome) -> Self {
        match outcome.detected {
            Some(true) => ScanVerdict::Blocked,
            Some(false) => ScanVerdict::Verified,
            None => ScanVerdict::Error,
        }
    }
}

pub type ScanReader = Pin<Box<dyn AsyncRead + Send>>;

/// Trait for virus scanning engines
#[async_trait::async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan a byte stream. `Err` means the engine or its transport failed.
    async fn scan(&self, reader: ScanReader) -> Result<ScanResult>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;
}

/// Parses a clamd reply such as `stream: Eicar-Signature FOUND` or `stream: OK`.
pub fn parse_clamd_reply(reply: &str) -> ScanResult {
    let mut signatures = Vec::new();
    let mut clean = false;

    for line in reply
        .split(['\0', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
    {
        let body = line.split_once(':').map(|(_, rest)| rest.trim()).unwrap_or(line);
        if let Some(signature) = body.strip_suffix("FOUND") {
            signatures.push(signature.trim().to_string());
        } else if body.ends_with("ERROR") {
            return ScanResult::Undetermined {
                reason: if body.contains("size limit exceeded") {
                    format!("{} (raise StreamMaxLength in clamd.conf)", body)
                } else {
                    body.to_string()
                },
            };
        } else if body == "OK" {
            clean = true;
        }
    }

    if !signatures.is_empty() {
        ScanResult::Infected { signatures }
    } else if clean {
        ScanResult::Clean
    } else {
        ScanResult::Undetermined {
            reason: format!("unexpected clamd reply: '{}'", reply.trim()),
        }
    }
}

/// ClamAV scanner using TCP socket (clamd)
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
    reply_timeout: Duration,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            reply_timeout: Duration::from_secs(300),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

#[async_trait::async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, mut reader: ScanReader) -> Result<ScanResult> {
        let mut stream = self.connect().await?;

        // INSTREAM framing: zINSTREAM\0 then <len:u32 BE><data>... terminated by a zero length
        stream.write_all(b"zINSTREAM\0").await?;

        const CHUNK_SIZE: usize = 256 * 1024;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total_sent: u64 = 0;
        let mut response = Vec::new();
        let mut read_buf = [0u8; 1024];

        // clamd may answer (and hang up) before the whole stream is sent, e.g. on a
        // size limit; keep reading its side while writing ours.
        let mut write_done = false;
        loop {
            tokio::select! {
                read = stream.read(&mut read_buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            response.extend_from_slice(&read_buf[..n]);
                            if response.contains(&0) || response.ends_with(b"\n") {
                                break;
                            }
                        }
                        Err(e) if !response.is_empty() => {
                            tracing::debug!("ClamAV read error after partial reply: {}", e);
                            break;
                        }
                        Err(e) => return Err(anyhow!("ClamAV read error: {}", e)),
                    }
                }
                chunk = reader.read(&mut buffer), if !write_done => {
                    let n = chunk.map_err(|e| anyhow!("Failed to read upload for scanning: {}", e))?;
                    if n == 0 {
                        stream.write_all(&0u32.to_be_bytes()).await?;
                        stream.flush().await?;
                        write_done = true;
                        tracing::debug!(total_sent, "Finished streaming upload to ClamAV");
                    } else {
                        stream.write_all(&(n as u32).to_be_bytes()).await?;
                        stream.write_all(&buffer[..n]).await?;
                        total_sent += n as u64;
                    }
                }
                _ = tokio::time::sleep(self.reply_timeout), if write_done => {
                    return Err(anyhow!("ClamAV did not answer within {:?} (sent {} bytes)", self.reply_timeout, total_sent));
                }
            }
        }

        if response.is_empty() {
            return Err(anyhow!(
                "ClamAV closed the connection without a reply (sent {} bytes)",
                total_sent
            ));
        }

        let reply = String::from_utf8_lossy(&response);
        tracing::debug!("ClamAV reply: '{}'", reply.trim_end_matches('\0').trim());
        Ok(parse_clamd_reply(&reply))
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl VirusScanner for NoOpScanner {
    async fn scan(&self, mut reader: ScanReader) -> Result<ScanResult> {
        tracing::warn!("NoOpScanner: Skipping virus scan (development mode)");
        // Drain so the fan-out never waits on this branch
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create appropriate scanner based on config
pub fn create_scanner(config: &IngestConfig) -> Box<dyn VirusScanner> {
    match config.virus_scanner_type.to_lowercase().as_str() {
        "clamav" => Box::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        )),
        "noop" | "none" | "disabled" => Box::new(NoOpScanner),
        other => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", other);
            Box::new(NoOpScanner)
        }
    }
}
