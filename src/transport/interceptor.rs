//! Interceptor chain wrapped around every RPC
//!
//! Two tower layers, outermost first:
//!
//! 1. [`RpcLogLayer`] logs the method before dispatch and the outcome after,
//!    and records it in the RPC metrics.
//! 2. [`PanicBoundaryLayer`] turns a panicking handler into a gRPC `INTERNAL`
//!    response so the connection and the server survive.
//!
//! Streaming responses get the same boundary through [`GuardedBody`]: a panic
//! while producing the next message ends the stream with `INTERNAL` trailers.
//! Recovering mid-stream is not attempted; the client sees the stream abort.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use http_body::{Body, Frame, SizeHint};
use tonic::{Code, Status};
use tower::layer::util::{Identity, Stack};
use tower::{Layer, Service, ServiceBuilder};
use tracing::{debug, error, info, warn};

use super::conn::ConnInfo;
use crate::metrics;

/// Boxed error used by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Message returned to clients when a handler panics
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// The full chain, ready for `Server::builder().layer(..)`
pub type InterceptorChain = Stack<PanicBoundaryLayer, Stack<RpcLogLayer, Identity>>;

/// Build the interceptor chain: logging outside, panic boundary inside
pub fn interceptor_chain() -> InterceptorChain {
    ServiceBuilder::new()
        .layer(RpcLogLayer)
        .layer(PanicBoundaryLayer)
        .into_inner()
}

// =============================================================================
// Logging
// =============================================================================

/// Logs every call and its outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcLogLayer;

impl<S> Layer<S> for RpcLogLayer {
    type Service = RpcLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcLog { inner }
    }
}

/// Service produced by [`RpcLogLayer`]
#[derive(Debug, Clone)]
pub struct RpcLog<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RpcLog<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        let info = req.extensions().get::<ConnInfo>().cloned().unwrap_or_default();
        let peer = info
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let client = info.peer_common_name.unwrap_or_default();

        info!(method = %method, peer = %peer, client = %client, "RPC call");
        let started = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let elapsed = started.elapsed();
            let elapsed_ms = elapsed.as_millis() as u64;
            let code = match &result {
                Ok(response) => match Status::from_header_map(response.headers()) {
                    Some(status) if status.code() != Code::Ok => {
                        error!(
                            method = %method,
                            code = ?status.code(),
                            message = %status.message(),
                            elapsed_ms,
                            "RPC call failed"
                        );
                        Some(status.code())
                    }
                    // Streaming responses carry their status in trailers
                    _ => {
                        debug!(method = %method, elapsed_ms, "RPC call completed");
                        Some(Code::Ok)
                    }
                },
                Err(_) => {
                    error!(method = %method, elapsed_ms, "RPC call failed in transport");
                    None
                }
            };
            metrics::record_rpc(&method, code, elapsed);
            result
        })
    }
}

// =============================================================================
// Panic containment
// =============================================================================

/// Converts handler panics into `INTERNAL` responses
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicBoundaryLayer;

impl<S> Layer<S> for PanicBoundaryLayer {
    type Service = PanicBoundary<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicBoundary { inner }
    }
}

/// Service produced by [`PanicBoundaryLayer`]
#[derive(Debug, Clone)]
pub struct PanicBoundary<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for PanicBoundary<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + Unpin + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = http::Response<GuardedBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();

        let fut = match panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                report_panic(&method, payload.as_ref());
                return Box::pin(async { Ok(internal_error_response()) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(response)) => Ok(response.map(|body| GuardedBody::new(body, method))),
                Ok(Err(e)) => Err(e),
                Err(payload) => {
                    report_panic(&method, payload.as_ref());
                    Ok(internal_error_response())
                }
            }
        })
    }
}

/// Response body that ends the stream with `INTERNAL` if the inner body panics
pub struct GuardedBody<B> {
    inner: Option<B>,
    method: String,
}

impl<B> GuardedBody<B> {
    fn new(inner: B, method: String) -> Self {
        Self {
            inner: Some(inner),
            method,
        }
    }

    fn empty() -> Self {
        Self {
            inner: None,
            method: String::new(),
        }
    }
}

impl<B> Body for GuardedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx))) {
            Ok(poll) => poll.map(|frame| frame.map(|result| result.map_err(Into::into))),
            Err(payload) => {
                this.inner = None;
                warn!(method = %this.method, "Aborting stream after handler panic");
                report_panic(&this.method, payload.as_ref());
                Poll::Ready(Some(Ok(Frame::trailers(internal_error_headers()))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, Body::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), Body::size_hint)
    }
}

fn report_panic(method: &str, payload: &(dyn Any + Send)) {
    error!(
        method = %method,
        panic = %panic_message(payload),
        "Recovered from panic in RPC handler"
    );
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn internal_error_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    headers.insert(
        "grpc-message",
        HeaderValue::from_static(INTERNAL_ERROR_MESSAGE),
    );
    headers
}

/// Trailers-only gRPC response carrying `INTERNAL`
fn internal_error_response<B>() -> http::Response<GuardedBody<B>> {
    let mut response = http::Response::new(GuardedBody::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.extend(internal_error_headers());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tower::ServiceExt;

    /// Body yielding one data frame, then panicking on the next poll
    struct PanicsAfterFirstFrame {
        sent: bool,
    }

    impl Body for PanicsAfterFirstFrame {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            if self.sent {
                panic!("stream producer exploded");
            }
            self.sent = true;
            Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"first")))))
        }
    }

    #[derive(Default)]
    struct Empty;

    impl Body for Empty {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(None)
        }

        fn is_end_stream(&self) -> bool {
            true
        }
    }

    fn request(path: &str) -> http::Request<()> {
        http::Request::builder()
            .uri(format!("http://agent{}", path))
            .body(())
            .unwrap()
    }

    async fn next_frame<B>(body: &mut B) -> Option<Result<Frame<Bytes>, B::Error>>
    where
        B: Body<Data = Bytes> + Unpin,
    {
        futures::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal() {
        let svc = tower::service_fn(|_req: http::Request<()>| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, Infallible>(http::Response::new(Empty))
        });
        let svc = ServiceBuilder::new().layer(interceptor_chain()).service(svc);

        let response = svc.oneshot(request("/warden.agent.v1.AgentService/HealthCheck")).await.unwrap();

        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), INTERNAL_ERROR_MESSAGE);
        assert!(response.body().is_end_stream());
    }

    #[tokio::test]
    async fn server_keeps_serving_after_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = tower::service_fn(move |_req: http::Request<()>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first call fails");
                }
                Ok::<_, Infallible>(http::Response::new(Empty))
            }
        });
        let mut svc = ServiceBuilder::new().layer(interceptor_chain()).service(svc);

        let first = ServiceExt::<http::Request<()>>::ready(&mut svc)
            .await
            .unwrap()
            .call(request("/a"))
            .await
            .unwrap();
        assert!(Status::from_header_map(first.headers()).is_some());

        let second = ServiceExt::<http::Request<()>>::ready(&mut svc)
            .await
            .unwrap()
            .call(request("/a"))
            .await
            .unwrap();
        assert!(Status::from_header_map(second.headers()).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn synchronous_panic_in_call_is_contained() {
        #[derive(Clone)]
        struct PanicsInCall;

        impl Service<http::Request<()>> for PanicsInCall {
            type Response = http::Response<Empty>;
            type Error = Infallible;
            type Future = std::future::Ready<Result<Self::Response, Infallible>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _req: http::Request<()>) -> Self::Future {
                panic!("router exploded");
            }
        }

        let svc = PanicBoundaryLayer.layer(PanicsInCall);
        let response = svc.oneshot(request("/a")).await.unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Internal);
    }

    #[tokio::test]
    async fn error_status_passes_through_untouched() {
        let svc = tower::service_fn(|_req: http::Request<()>| async move {
            let mut response = http::Response::new(Empty);
            response
                .headers_mut()
                .insert("grpc-status", HeaderValue::from(Code::InvalidArgument as i32));
            Ok::<_, Infallible>(response)
        });
        let svc = ServiceBuilder::new().layer(interceptor_chain()).service(svc);

        let response = svc.oneshot(request("/a")).await.unwrap();
        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn streaming_panic_aborts_with_internal_trailers() {
        let svc = tower::service_fn(|_req: http::Request<()>| async move {
            Ok::<_, Infallible>(http::Response::new(PanicsAfterFirstFrame { sent: false }))
        });
        let svc = ServiceBuilder::new().layer(interceptor_chain()).service(svc);

        let response = svc.oneshot(request("/warden.agent.v1.AgentService/StreamLogs")).await.unwrap();
        let mut body = response.into_body();

        let first = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"first"));

        let trailers = next_frame(&mut body)
            .await
            .unwrap()
            .unwrap()
            .into_trailers()
            .unwrap();
        let status = Status::from_header_map(&trailers).unwrap();
        assert_eq!(status.code(), Code::Internal);

        assert!(next_frame(&mut body).await.is_none());
        assert!(body.is_end_stream());
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn Any + Send> = Box::new("static text");
        assert_eq!(panic_message(payload.as_ref()), "static text");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        assert_eq!(panic_message(payload.as_ref()), "owned text");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
