use crate::AppState;
use crate::api::error::AppError;
use crate::services::deadline::{DeadlineScope, InboundConnection};
use axum::{
    body::{Body, BodyDataStream},
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Request body that can be cut off from outside
struct GuardedBody {
    inner: BodyDataStream,
    cut: Pin<Box<WaitForCancellationFutureOwned>>,
    state: Arc<BodyState>,
    finished: bool,
}

struct BodyState {
    open: AtomicBool,
    cut: CancellationToken,
}

impl InboundConnection for BodyState {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn terminate(&self) {
        self.cut.cancel();
    }
}

impl GuardedBody {
    fn wrap(body: Body) -> (Self, Arc<BodyState>) {
        let cut = CancellationToken::new();
        let state = Arc::new(BodyState {
            open: AtomicBool::new(true),
            cut: cut.clone(),
        });
        let guarded = Self {
            inner: body.into_data_stream(),
            cut: Box::pin(cut.cancelled_owned()),
            state: state.clone(),
            finished: false,
        };
        (guarded, state)
    }

    fn close(&mut self) {
        self.finished = true;
        self.state.open.store(false, Ordering::Release);
    }
}

impl Stream for GuardedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.cut.as_mut().poll(cx).is_ready() {
            self.close();
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection terminated after deadline",
            ))));
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                self.close();
                Poll::Ready(Some(Err(io::Error::other(e))))
            }
            Poll::Ready(None) => {
                self.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        self.state.open.store(false, Ordering::Release);
    }
}

/// Arms the deadline for the matched route around the rest of the stack.
///
/// Handlers find the [`DeadlineScope`] in the request extensions. On expiry the
/// handler gets the grace period to unwind, the response is a 408 carrying
/// retry-discouraging headers, and the request body is cut off after the grace
/// period if anything still holds it.
pub async fn deadline_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let route_key = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let handle = match state.deadlines.for_route(&route_key) {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    let (parts, body) = req.into_parts();
    let (guarded, connection) = GuardedBody::wrap(body);
    let mut req = Request::from_parts(parts, Body::from_stream(guarded));
    req.extensions_mut().insert::<DeadlineScope>(handle.scope());

    let _terminator = handle.terminate_after_grace(connection);

    match handle.run(next.run(req)).await {
        Ok(response) => response,
        Err(exceeded) => {
            tracing::warn!(route = %route_key, timeout_ms = exceeded.timeout_ms, "⏰ Request exceeded its deadline");
            AppError::from(exceeded).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_terminated_body_errors_instead_of_ending() {
        let body = Body::from_stream(stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"a"))]).chain(stream::pending()));
        let (mut guarded, connection) = GuardedBody::wrap(body);

        assert_eq!(guarded.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(connection.is_open());

        connection.terminate();
        let err = guarded.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(!connection.is_open());
        assert!(guarded.next().await.is_none());
    }

    #[tokio::test]
    async fn test_completed_body_reports_closed() {
        let (mut guarded, connection) = GuardedBody::wrap(Body::from("done"));
        assert_eq!(guarded.next().await.unwrap().unwrap(), Bytes::from_static(b"done"));
        assert!(guarded.next().await.is_none());
        assert!(!connection.is_open());
    }
}
