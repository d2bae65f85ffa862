use crate::api::error::AppError;
use crate::config::IngestConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const FIRED: u8 = 2;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("deadline of {timeout_ms}ms exceeded")]
pub struct DeadlineExceeded {
    pub timeout_ms: u64,
}

/// Something that holds the inbound side of a request open and can be cut off.
pub trait InboundConnection: Send + Sync {
    fn is_open(&self) -> bool;

    fn terminate(&self);
}

/// Resolves per-request timeouts and arms deadlines
#[derive(Debug, Clone)]
pub struct DeadlineController {
    default_timeout_ms: u64,
    route_timeouts: HashMap<String, u64>,
    grace: Duration,
}

impl DeadlineController {
    pub fn new(default_timeout_ms: u64, route_timeouts: HashMap<String, u64>, grace: Duration) -> Self {
        Self {
            default_timeout_ms,
            route_timeouts,
            grace,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.upload_timeout_ms,
            config.route_timeouts.clone(),
            config.deadline_grace(),
        )
    }

    /// Route override first, then the process-wide default. A non-positive result
    /// fails closed.
    pub fn resolve_timeout(&self, route_key: &str) -> Result<Duration, AppError> {
        let timeout_ms = self
            .route_timeouts
            .get(route_key)
            .copied()
            .unwrap_or(self.default_timeout_ms);

        if timeout_ms == 0 {
            return Err(AppError::Internal(format!(
                "no valid timeout configured for route '{}'",
                route_key
            )));
        }
        Ok(Duration::from_millis(timeout_ms))
    }

    pub fn for_route(&self, route_key: &str) -> Result<DeadlineHandle, AppError> {
        let timeout = self.resolve_timeout(route_key)?;
        Ok(self.with_deadline(timeout))
    }

    /// Arms a timer. Must be called from within a tokio runtime.
    pub fn with_deadline(&self, timeout: Duration) -> DeadlineHandle {
        DeadlineHandle::start(timeout, self.grace)
    }
}

struct DeadlineState {
    phase: AtomicU8,
    signal: CancellationToken,
    disposed: CancellationToken,
    timeout: Duration,
    grace: Duration,
}

impl DeadlineState {
    fn fire(&self) -> bool {
        let fired = self
            .phase
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if fired {
            tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "⏰ Deadline fired, cancelling in-flight work");
            self.signal.cancel();
        }
        fired
    }

    /// True if the work owns completion, whether claimed now or earlier.
    fn complete(&self) -> bool {
        match self
            .phase
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(phase) => phase == COMPLETED,
        }
    }

    fn exceeded(&self) -> DeadlineExceeded {
        DeadlineExceeded {
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// The view of a deadline handed to the work running under it.
///
/// Work must stop promptly once [`signal`](Self::signal) fires, and must win
/// [`complete`](Self::complete) before making anything durable.
#[derive(Clone)]
pub struct DeadlineScope {
    state: Arc<DeadlineState>,
}

impl DeadlineScope {
    /// A scope that never fires, for work not bounded by any deadline.
    pub fn unbounded() -> Self {
        Self {
            state: Arc::new(DeadlineState {
                phase: AtomicU8::new(PENDING),
                signal: CancellationToken::new(),
                disposed: CancellationToken::new(),
                timeout: Duration::MAX,
                grace: Duration::ZERO,
            }),
        }
    }

    pub fn signal(&self) -> CancellationToken {
        self.state.signal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.signal.is_cancelled()
    }

    /// Claims completion ahead of the timer. Once this returns true the deadline can
    /// no longer fire; false means it already has.
    pub fn complete(&self) -> bool {
        self.state.complete()
    }

    pub fn exceeded(&self) -> DeadlineExceeded {
        self.state.exceeded()
    }
}

/// Cancellation signal plus timeout for one request.
///
/// Exactly one of "completed" and "fired" wins; the loser has no effect.
pub struct DeadlineHandle {
    state: Arc<DeadlineState>,
    timer: JoinHandle<()>,
}

impl DeadlineHandle {
    fn start(timeout: Duration, grace: Duration) -> Self {
        let state = Arc::new(DeadlineState {
            phase: AtomicU8::new(PENDING),
            signal: CancellationToken::new(),
            disposed: CancellationToken::new(),
            timeout,
            grace,
        });

        let timer_state = state.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timer_state.timeout).await;
            timer_state.fire();
        });

        Self { state, timer }
    }

    /// The token every blocking branch under this deadline must observe.
    pub fn signal(&self) -> CancellationToken {
        self.state.signal.clone()
    }

    pub fn scope(&self) -> DeadlineScope {
        DeadlineScope {
            state: self.state.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.state.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn has_fired(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == FIRED
    }

    /// Fires the deadline now. Returns false if it already fired or the work completed.
    pub fn fire(&self) -> bool {
        self.state.fire()
    }

    /// Claims normal completion. Returns false if the deadline got there first.
    pub fn complete(&self) -> bool {
        self.state.complete()
    }

    pub fn exceeded(&self) -> DeadlineExceeded {
        self.state.exceeded()
    }

    /// Runs `work` under the deadline.
    ///
    /// Once the deadline fires, `work` is given the grace period to observe the
    /// signal and run its own cleanup before it is dropped. The result is `Ok`
    /// only if completion was claimed before the timer fired.
    pub async fn run<F>(&self, work: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        let signal = self.state.signal.clone();
        tokio::pin!(work);

        tokio::select! {
            biased;
            output = &mut work => {
                return if self.complete() {
                    Ok(output)
                } else {
                    Err(self.exceeded())
                };
            }
            _ = signal.cancelled() => {}
        }

        if tokio::time::timeout(self.state.grace, &mut work).await.is_err() {
            tracing::warn!(
                grace_ms = self.state.grace.as_millis() as u64,
                "Work ignored the deadline signal for the whole grace period, dropping it"
            );
        }
        Err(self.exceeded())
    }

    /// Once the deadline fires, waits out the grace period and cuts the connection
    /// if it is still open. Does nothing if the work completes first.
    pub fn terminate_after_grace(&self, connection: Arc<dyn InboundConnection>) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = state.signal.cancelled() => {}
                _ = state.disposed.cancelled() => return,
            }
            if state.phase.load(Ordering::Acquire) != FIRED {
                return;
            }
            tokio::time::sleep(state.grace).await;
            if connection.is_open() {
                tracing::warn!("🔌 Connection still open after deadline grace period, terminating");
                connection.terminate();
            }
        })
    }

    /// Stops the timer. Equivalent to dropping the handle.
    pub fn dispose(self) {}
}

impl Drop for DeadlineHandle {
    fn drop(&mut self) {
        self.timer.abort();
        self.state.disposed.cancel();
    }
}
