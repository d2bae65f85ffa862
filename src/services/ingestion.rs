//! Drives one upload from the inbound byte stream to a committed-or-aborted result.

use crate::api::error::AppError;
use crate::config::{IngestConfig, ScanMode};
use crate::services::deadline::{DeadlineHandle, DeadlineScope};
use crate::services::distributor::StreamDistributor;
use crate::services::lifecycle::{CommitRefused, SessionId, UploadLifecycleMonitor};
use crate::services::scan_dispatcher::ScanRequestDispatcher;
use crate::services::scanner::{ScanOutcome, ScanVerdict};
use crate::services::storage::{ObjectStorage, StoredObject};
use crate::utils::fingerprint::RequestFingerprint;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::io;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Client went away or the session was aborted from outside
    ClientAborted,
    /// The request deadline fired
    Deadline,
    /// The session entry was evicted before it could commit
    SessionLost,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommittedUpload {
    pub session_id: String,
    pub object: StoredObject,
    pub scan: ScanVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_outcome: Option<ScanOutcome>,
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Committed(CommittedUpload),
    Aborted { session_id: SessionId, reason: AbortReason },
}

impl IngestOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, IngestOutcome::Committed(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum FailedBranch {
    Storage,
    Scan,
}

pub struct IngestionCoordinator {
    monitor: Arc<UploadLifecycleMonitor>,
    distributor: StreamDistributor,
    storage: Arc<dyn ObjectStorage>,
    dispatcher: Arc<ScanRequestDispatcher>,
}

impl IngestionCoordinator {
    pub fn new(
        config: &IngestConfig,
        monitor: Arc<UploadLifecycleMonitor>,
        storage: Arc<dyn ObjectStorage>,
        dispatcher: Arc<ScanRequestDispatcher>,
    ) -> Self {
        Self {
            monitor,
            distributor: StreamDistributor::new(config.branch_buffer_chunks),
            storage,
            dispatcher,
        }
    }

    pub fn monitor(&self) -> &Arc<UploadLifecycleMonitor> {
        &self.monitor
    }

    /// Refuses likely browser replays, otherwise opens a session. Runs before any
    /// byte of the body is read.
    pub fn admit(&self, fingerprint: &RequestFingerprint) -> Result<SessionId, AppError> {
        if self.monitor.is_likely_duplicate(fingerprint) {
            tracing::warn!(
                client = %fingerprint.client_addr,
                content_length = ?fingerprint.content_length,
                agent = %fingerprint.agent_family,
                "🔁 Rejecting likely duplicate upload"
            );
            return Err(AppError::DuplicateUpload(
                "an identical upload from this client is already in progress".to_string(),
            ));
        }
        Ok(self.monitor.begin(fingerprint))
    }

    /// Admission, ingestion and session cleanup under `deadline`.
    pub async fn run<S>(
        &self,
        fingerprint: &RequestFingerprint,
        path: &str,
        source: S,
        deadline: &DeadlineHandle,
    ) -> Result<IngestOutcome, AppError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let session = self.admit(fingerprint)?;
        let result = deadline
            .run(self.ingest(&session, path, source, deadline.scope()))
            .await;
        if result.is_err() {
            self.monitor.mark_aborted(&session);
            // Only reaches a write whose future outlived the grace period and was dropped
            match self.storage.abort(path).await {
                Ok(true) => tracing::warn!(path, "Stopped a storage write left behind by the deadline"),
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to abort storage write for {}: {}", path, e),
            }
        }
        self.monitor.complete(&session);
        result?
    }

    /// Fans `source` out to storage and (inline mode) the scanner, then commits the
    /// session unless it was aborted in the meantime. Does not remove the session.
    ///
    /// When `deadline` fires, every branch stops, the partial or finished object is
    /// removed and the outcome is `Aborted(Deadline)`. Commit happens only after
    /// completion was claimed from `deadline`.
    #[tracing::instrument(skip(self, session, source, deadline), fields(session_id = %session))]
    pub async fn ingest<S>(
        &self,
        session: &SessionId,
        path: &str,
        source: S,
        deadline: DeadlineScope,
    ) -> Result<IngestOutcome, AppError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let cancel = deadline.signal();
        let mode = self.dispatcher.mode();
        let branch_count = if mode == ScanMode::Inline { 2 } else { 1 };

        // Child of the deadline so a failed branch can stop its siblings without
        // touching the caller's signal
        let pipeline = cancel.child_token();
        let fanout = self
            .distributor
            .distribute(source, branch_count, pipeline.clone())?;
        let mut branches = fanout.branches.into_iter();
        let storage_branch = branches
            .next()
            .ok_or_else(|| AppError::Internal("fan-out produced no storage branch".to_string()))?;
        let scan_branch = branches.next();

        let first_failed = OnceLock::new();
        let store = async {
            let result = self
                .storage
                .put_stream(path, Box::pin(storage_branch.into_reader()), pipeline.clone())
                .await;
            if result.is_err() {
                let _ = first_failed.set(FailedBranch::Storage);
                pipeline.cancel();
            }
            result
        };
        let scan = async {
            let branch = scan_branch?;
            let result = self.dispatcher.scan_inline(Box::pin(branch.into_reader())).await;
            if result.is_err() {
                let _ = first_failed.set(FailedBranch::Scan);
                pipeline.cancel();
            }
            Some(result)
        };

        let (pumped, stored, scanned) = tokio::join!(fanout.pump, store, scan);

        if cancel.is_cancelled() {
            return Ok(self.abort(session, path, stored.ok(), AbortReason::Deadline).await);
        }
        if let Err(fault) = pumped {
            // A fault caused by our own cancellation is reported by the branch that failed
            if !fault.is_cancellation() {
                self.abort(session, path, stored.ok(), AbortReason::ClientAborted).await;
                return Err(AppError::BadRequest(format!("upload stream interrupted: {}", fault)));
            }
        }

        let storage_failed_first = matches!(first_failed.get(), Some(FailedBranch::Storage));
        let scan_outcome = match scanned {
            Some(Err(e)) if !storage_failed_first => {
                self.abort(session, path, stored.ok(), AbortReason::ClientAborted).await;
                return Err(e);
            }
            Some(Ok(outcome)) => Some(outcome),
            // Not scanning, or the scan was cut short by the storage failure below
            _ => None,
        };
        let object = match stored {
            Ok(object) => object,
            Err(e) => {
                self.monitor.mark_aborted(session);
                return Err(AppError::Anyhow(e.context(format!("storing '{}' failed", path))));
            }
        };

        if self.monitor.is_aborted(session) {
            return Ok(self.abort(session, path, Some(object), AbortReason::ClientAborted).await);
        }

        let scan = match (&scan_outcome, mode) {
            (Some(outcome), _) => ScanVerdict::from_outcome(outcome),
            (None, ScanMode::Async) => {
                let token = match self.dispatcher.correlation_token(&object.path) {
                    Ok(token) => token,
                    Err(e) => {
                        self.abort(session, path, Some(object), AbortReason::ClientAborted).await;
                        return Err(e);
                    }
                };
                if let Err(e) = self.dispatcher.dispatch(token.as_ref(), &cancel).await {
                    if cancel.is_cancelled() {
                        return Ok(self.abort(session, path, Some(object), AbortReason::Deadline).await);
                    }
                    self.abort(session, path, Some(object), AbortReason::ClientAborted).await;
                    return Err(e);
                }
                ScanVerdict::Pending
            }
            (None, _) => ScanVerdict::WontCheck,
        };

        if !deadline.complete() {
            return Ok(self.abort(session, path, Some(object), AbortReason::Deadline).await);
        }

        match self.monitor.try_commit(session) {
            Ok(()) => {
                tracing::info!(path, size = object.size, ?scan, "✅ Upload committed");
                Ok(IngestOutcome::Committed(CommittedUpload {
                    session_id: session.to_string(),
                    object,
                    scan,
                    scan_outcome,
                }))
            }
            Err(refused) => {
                let reason = match refused {
                    CommitRefused::Unknown(_) => AbortReason::SessionLost,
                    CommitRefused::Aborted(_) | CommitRefused::AlreadyCommitted(_) => {
                        AbortReason::ClientAborted
                    }
                };
                tracing::warn!("Commit refused: {}", refused);
                Ok(self.abort(session, path, Some(object), reason).await)
            }
        }
    }

    /// Marks the session aborted and removes whatever storage produced.
    async fn abort(
        &self,
        session: &SessionId,
        path: &str,
        stored: Option<StoredObject>,
        reason: AbortReason,
    ) -> IngestOutcome {
        self.monitor.mark_aborted(session);
        if let Some(object) = stored {
            if let Err(e) = self.storage.delete(&object.path).await {
                tracing::error!("Failed to remove aborted object {}: {}", object.path, e);
            }
        }
        tracing::warn!(path, ?reason, "Upload aborted, nothing committed");
        IngestOutcome::Aborted {
            session_id: session.clone(),
            reason,
        }
    }
}
