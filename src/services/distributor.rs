//! Fan-out of one upload byte stream into N independent branch streams.
//!
//! Every branch has its own bounded channel, so a slow branch pauses the source
//! instead of growing a buffer. A source fault is recorded once and surfaced by
//! every live branch after the chunks it already buffered. Dropping a branch only
//! detaches that branch.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// The fault that ended the source, shared by every branch it was reported to.
#[derive(Debug, Clone, Error)]
#[error("upload source failed: {0}")]
pub struct SourceFault(pub Arc<io::Error>);

impl SourceFault {
    pub fn cause(&self) -> &Arc<io::Error> {
        &self.0
    }

    /// Finds the shared fault behind a branch read error, if that is what it was.
    pub fn from_io(err: &io::Error) -> Option<&SourceFault> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<SourceFault>())
    }

    /// True when the source was stopped by the cancellation token rather than failing.
    pub fn is_cancellation(&self) -> bool {
        self.0.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
    }

    fn to_io(&self) -> io::Error {
        io::Error::new(self.0.kind(), self.clone())
    }
}

#[derive(Debug, Error)]
#[error("upload cancelled")]
struct Cancelled;

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, Cancelled)
}

#[derive(Debug, Default)]
struct FanoutShared {
    fault: OnceLock<SourceFault>,
}

/// One consumer's view of the source
pub struct Branch {
    index: usize,
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<FanoutShared>,
    fault_reported: bool,
}

impl Branch {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn into_reader(self) -> StreamReader<Branch, Bytes> {
        StreamReader::new(self)
    }

    /// Detaches this branch; siblings and the source are unaffected.
    pub fn destroy(self) {
        tracing::debug!(branch = self.index, "Branch destroyed by its consumer");
    }
}

impl Stream for Branch {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                if self.fault_reported {
                    return Poll::Ready(None);
                }
                self.fault_reported = true;
                Poll::Ready(self.shared.fault.get().map(|fault| Err(fault.to_io())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// What the pump saw once the source was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub bytes: u64,
    pub chunks: u64,
    /// Branches still attached when the source ended
    pub live_branches: usize,
}

pub type PumpFuture = Pin<Box<dyn Future<Output = Result<FanoutReport, SourceFault>> + Send>>;

/// Branches plus the future that feeds them. The pump must be polled alongside the
/// branch consumers (or spawned) for any bytes to flow.
pub struct Fanout {
    pub branches: Vec<Branch>,
    pub pump: PumpFuture,
}

#[derive(Debug, Clone)]
pub struct StreamDistributor {
    buffer_chunks: usize,
}

impl StreamDistributor {
    pub fn new(buffer_chunks: usize) -> Self {
        Self {
            buffer_chunks: buffer_chunks.max(1),
        }
    }

    pub fn distribute<S>(
        &self,
        source: S,
        branch_count: usize,
        cancel: CancellationToken,
    ) -> Result<Fanout, anyhow::Error>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if branch_count == 0 {
            anyhow::bail!("fan-out needs at least one branch");
        }

        let shared = Arc::new(FanoutShared::default());
        let mut senders = Vec::with_capacity(branch_count);
        let mut branches = Vec::with_capacity(branch_count);
        for index in 0..branch_count {
            let (tx, rx) = mpsc::channel(self.buffer_chunks);
            senders.push(Some(tx));
            branches.push(Branch {
                index,
                rx,
                shared: shared.clone(),
                fault_reported: false,
            });
        }

        let pump = Box::pin(pump(Box::pin(source), senders, shared, cancel));
        Ok(Fanout { branches, pump })
    }
}

fn fail(shared: &FanoutShared, err: io::Error) -> SourceFault {
    let fault = SourceFault(Arc::new(err));
    let _ = shared.fault.set(fault.clone());
    fault
}

async fn pump(
    mut source: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>,
    mut senders: Vec<Option<mpsc::Sender<Bytes>>>,
    shared: Arc<FanoutShared>,
    cancel: CancellationToken,
) -> Result<FanoutReport, SourceFault> {
    let mut report = FanoutReport {
        bytes: 0,
        chunks: 0,
        live_branches: senders.len(),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(fail(&shared, cancelled()));
            }
            item = source.next() => item,
        };

        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::warn!(error = %err, bytes = report.bytes, "Upload source failed, failing all branches");
                return Err(fail(&shared, err));
            }
        };

        report.bytes += chunk.len() as u64;
        report.chunks += 1;

        for (index, slot) in senders.iter_mut().enumerate() {
            let Some(tx) = slot else { continue };
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(fail(&shared, cancelled()));
                }
                sent = tx.send(chunk.clone()) => sent,
            };
            if sent.is_err() {
                tracing::debug!(branch = index, "Branch detached, no longer feeding it");
                *slot = None;
            }
        }

        report.live_branches = senders.iter().filter(|s| s.is_some()).count();
        if report.live_branches == 0 {
            tracing::debug!("Every branch detached, stopping the source");
            break;
        }
    }

    Ok(report)
}
