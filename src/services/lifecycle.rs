use crate::config::IngestConfig;
use crate::utils::fingerprint::{AgentFamily, RequestFingerprint};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Aborted,
    Committed,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: SessionId,
    pub fingerprint: RequestFingerprint,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    started: Instant,
}

impl UploadSession {
    pub fn aborted(&self) -> bool {
        self.state == SessionState::Aborted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitRefused {
    #[error("upload session {0} was aborted")]
    Aborted(SessionId),
    #[error("upload session {0} already committed")]
    AlreadyCommitted(SessionId),
    #[error("upload session {0} is not tracked")]
    Unknown(SessionId),
}

type RecentKey = (IpAddr, u64, AgentFamily);

/// Tracks in-flight uploads, their abort flag, and recent starts for duplicate detection.
///
/// Entries are bounded both by TTL and by capacity. Recent starts outlive their session
/// for the duplicate window, so a replay that arrives after the first attempt finished
/// (for example after a deadline response) is still recognised.
pub struct UploadLifecycleMonitor {
    sessions: DashMap<SessionId, UploadSession>,
    recent: DashMap<RecentKey, Instant>,
    seq: AtomicU64,
    window: Duration,
    ttl: Duration,
    capacity: usize,
    retry_prone: Vec<String>,
}

impl UploadLifecycleMonitor {
    pub fn new(window: Duration, ttl: Duration, capacity: usize, retry_prone: Vec<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            recent: DashMap::new(),
            seq: AtomicU64::new(0),
            window,
            ttl,
            capacity: capacity.max(1),
            retry_prone: retry_prone.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.duplicate_window(),
            config.session_ttl(),
            config.session_capacity,
            config.retry_prone_agents.clone(),
        )
    }

    fn is_retry_prone(&self, family: AgentFamily) -> bool {
        self.retry_prone.iter().any(|f| f == family.as_str())
    }

    fn recent_key(fingerprint: &RequestFingerprint) -> Option<RecentKey> {
        fingerprint
            .content_length
            .map(|len| (fingerprint.client_addr, len, fingerprint.agent_family))
    }

    /// True when the same client recently started an upload of the same declared size
    /// with an agent that replays requests on timeout. A heuristic, not a guarantee.
    pub fn is_likely_duplicate(&self, fingerprint: &RequestFingerprint) -> bool {
        if !self.is_retry_prone(fingerprint.agent_family) {
            return false;
        }
        let Some(key) = Self::recent_key(fingerprint) else {
            return false;
        };
        self.recent
            .get(&key)
            .is_some_and(|started| started.elapsed() <= self.window)
    }

    pub fn begin(&self, fingerprint: &RequestFingerprint) -> SessionId {
        if self.sessions.len() >= self.capacity {
            self.make_room();
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = SessionId(format!(
            "{}-{}-{}-{}",
            fingerprint.client_addr,
            fingerprint
                .content_length
                .map(|l| l.to_string())
                .unwrap_or_else(|| "chunked".to_string()),
            started_at.timestamp_micros(),
            seq
        ));

        if let Some(key) = Self::recent_key(fingerprint) {
            self.recent.insert(key, started);
        }
        self.sessions.insert(
            id.clone(),
            UploadSession {
                id: id.clone(),
                fingerprint: fingerprint.clone(),
                started_at,
                state: SessionState::Active,
                started,
            },
        );
        tracing::debug!(session_id = %id, "Upload session started");
        id
    }

    /// Records an early disconnect, explicit abort, or deadline. Returns true if this
    /// call moved the session out of the active state.
    pub fn mark_aborted(&self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) if session.state == SessionState::Active => {
                session.state = SessionState::Aborted;
                tracing::info!(session_id = %id, "Upload session marked aborted");
                true
            }
            _ => false,
        }
    }

    pub fn is_aborted(&self, id: &SessionId) -> bool {
        self.sessions.get(id).is_some_and(|s| s.aborted())
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|s| s.state)
    }

    /// The single terminal transition to `Committed`. Refused once the session was
    /// aborted, committed, or evicted.
    pub fn try_commit(&self, id: &SessionId) -> Result<(), CommitRefused> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| CommitRefused::Unknown(id.clone()))?;
        match session.state {
            SessionState::Active => {
                session.state = SessionState::Committed;
                Ok(())
            }
            SessionState::Aborted => Err(CommitRefused::Aborted(id.clone())),
            SessionState::Committed => Err(CommitRefused::AlreadyCommitted(id.clone())),
        }
    }

    /// Drops the session entry. The recent-start record is kept for the duplicate window.
    pub fn complete(&self, id: &SessionId) -> Option<SessionState> {
        let removed = self.sessions.remove(id).map(|(_, s)| s.state);
        if let Some(state) = removed {
            tracing::debug!(session_id = %id, ?state, "Upload session finished");
        }
        removed
    }

    /// Evicts sessions older than the TTL and recent starts older than the window.
    pub fn sweep_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.started.elapsed() < self.ttl);
        self.recent.retain(|_, started| started.elapsed() <= self.window);
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            tracing::warn!(evicted, "Evicted upload sessions that were never completed");
        }
        evicted
    }

    fn make_room(&self) {
        self.sweep_expired();
        while self.sessions.len() >= self.capacity {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|entry| entry.started)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    tracing::warn!(session_id = %id, "Session table full, evicting oldest entry");
                    self.sessions.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 AppleWebKit/537.36 Chrome/126.0 Safari/537.36";

    fn monitor() -> UploadLifecycleMonitor {
        UploadLifecycleMonitor::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
            16,
            vec!["chromium".to_string()],
        )
    }

    fn fingerprint(len: u64, ua: &str) -> RequestFingerprint {
        RequestFingerprint::new("10.0.0.7".parse().unwrap(), Some(len), Some(ua))
    }

    #[test]
    fn test_retry_from_prone_agent_is_duplicate() {
        let monitor = monitor();
        let fp = fingerprint(1024, CHROME);
        assert!(!monitor.is_likely_duplicate(&fp));
        let id = monitor.begin(&fp);
        assert!(monitor.is_likely_duplicate(&fp));

        monitor.complete(&id);
        assert!(monitor.is_likely_duplicate(&fp), "window outlives the session");
    }

    #[test]
    fn test_duplicate_needs_matching_length_and_prone_agent() {
        let monitor = monitor();
        monitor.begin(&fingerprint(1024, CHROME));
        assert!(!monitor.is_likely_duplicate(&fingerprint(2048, CHROME)));

        let firefox = "Mozilla/5.0 Gecko/20100101 Firefox/127.0";
        monitor.begin(&fingerprint(4096, firefox));
        assert!(!monitor.is_likely_duplicate(&fingerprint(4096, firefox)));

        let chunked = RequestFingerprint::new("10.0.0.7".parse().unwrap(), None, Some(CHROME));
        monitor.begin(&chunked);
        assert!(!monitor.is_likely_duplicate(&chunked));
    }

    #[test]
    fn test_commit_refused_after_abort() {
        let monitor = monitor();
        let id = monitor.begin(&fingerprint(10, CHROME));
        assert!(monitor.mark_aborted(&id));
        assert!(!monitor.mark_aborted(&id));
        assert_eq!(monitor.try_commit(&id), Err(CommitRefused::Aborted(id.clone())));
    }

    #[test]
    fn test_commit_is_terminal() {
        let monitor = monitor();
        let id = monitor.begin(&fingerprint(10, CHROME));
        assert!(monitor.try_commit(&id).is_ok());
        assert!(!monitor.mark_aborted(&id), "abort after commit is ignored");
        assert_eq!(
            monitor.try_commit(&id),
            Err(CommitRefused::AlreadyCommitted(id.clone()))
        );
        assert_eq!(monitor.complete(&id), Some(SessionState::Committed));
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let monitor = UploadLifecycleMonitor::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
            2,
            vec![],
        );
        let first = monitor.begin(&fingerprint(1, CHROME));
        let second = monitor.begin(&fingerprint(2, CHROME));
        let third = monitor.begin(&fingerprint(3, CHROME));

        assert_eq!(monitor.len(), 2);
        assert!(monitor.state(&first).is_none());
        assert!(monitor.state(&second).is_some());
        assert!(monitor.state(&third).is_some());
        assert!(matches!(monitor.try_commit(&first), Err(CommitRefused::Unknown(_))));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_sessions() {
        let monitor = UploadLifecycleMonitor::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            16,
            vec!["chromium".to_string()],
        );
        let fp = fingerprint(5, CHROME);
        monitor.begin(&fp);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(monitor.sweep_expired(), 1);
        assert!(monitor.is_empty());
        assert!(!monitor.is_likely_duplicate(&fp));
    }
}
