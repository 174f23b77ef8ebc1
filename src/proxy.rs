use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{BackendFailure, ForwardError, InboundError, InboundRequest, RequestForwarder};
use crate::relay::{client_gone, relay, ProxyBody};
use crate::supervisor::{BackendSupervisor, EnsureOutcome, SupervisorError};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-request orchestration: ensure the backend, forward, relay
pub struct ProxyHandler {
    supervisor: Arc<BackendSupervisor>,
    forwarder: Arc<RequestForwarder>,
    max_body_bytes: usize,
}

impl ProxyHandler {
    pub fn new(
        supervisor: Arc<BackendSupervisor>,
        forwarder: Arc<RequestForwarder>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            supervisor,
            forwarder,
            max_body_bytes,
        }
    }

    pub fn supervisor(&self) -> &Arc<BackendSupervisor> {
        &self.supervisor
    }

    pub fn forwarder(&self) -> &Arc<RequestForwarder> {
        &self.forwarder
    }

    /// Handle one inbound request. Every failure becomes a JSON error
    /// response; nothing is retried.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = Uuid::new_v4().to_string();
        debug!(request_id, method = %req.method(), uri = %req.uri(), "Incoming request");

        // A failed start does not stop forwarding; the backend may have been
        // started by someone else
        let start_failure = match self.supervisor.ensure_running() {
            Ok(outcome) => {
                self.await_readiness(outcome, &request_id).await;
                None
            }
            Err(e) => {
                // The supervisor logs the spawn failure itself
                debug!(request_id, error = %e, "Backend not started, forwarding anyway");
                Some(e)
            }
        };

        let inbound = match InboundRequest::from_request(req, self.max_body_bytes).await {
            Ok(inbound) => inbound,
            Err(InboundError::TooLarge { limit }) => {
                warn!(request_id, limit, "Request body too large");
                return json_error_response(ProxyErrorCode::PayloadTooLarge, "Request body too large");
            }
            Err(e) => {
                debug!(request_id, error = %e, "Failed to read request body");
                return json_error_response(
                    ProxyErrorCode::BadRequestBody,
                    "Failed to read request body",
                );
            }
        };

        let method = inbound.method.clone();
        let target = inbound.path_and_query.clone();

        match self.forwarder.forward(inbound).await {
            Ok(response) => {
                debug!(
                    request_id,
                    %method,
                    target,
                    status = response.status.as_u16(),
                    body_bytes = response.body.len(),
                    "Relaying backend response"
                );
                relay(response)
            }
            Err(e) => {
                // Log detailed error internally, return generic message externally
                error!(request_id, %method, target, error = %e, "Failed to forward request");
                failure_response(&e, start_failure.as_ref())
            }
        }
    }

    /// Optionally wait for a freshly launched backend to accept connections
    async fn await_readiness(&self, outcome: EnsureOutcome, request_id: &str) {
        let timeout = self.supervisor.config().ready_timeout();
        if timeout.is_zero() || outcome == EnsureOutcome::AlreadyRunning {
            return;
        }

        if !self.supervisor.wait_until_listening(timeout).await {
            warn!(
                request_id,
                timeout_ms = timeout.as_millis(),
                "Backend not listening yet, forwarding anyway"
            );
        }
    }
}

/// Map a forwarding failure to the response sent to the caller
fn failure_response(err: &ForwardError, start_failure: Option<&SupervisorError>) -> Response<ProxyBody> {
    match err {
        ForwardError::BackendUnreachable(_) if start_failure.is_some() => {
            json_error_response(ProxyErrorCode::BackendStartFailed, "Backend unavailable")
        }
        ForwardError::BackendUnreachable(BackendFailure::Timeout(timeout)) => json_error_response(
            ProxyErrorCode::RequestTimeout,
            format!("Request timed out after {} seconds", timeout.as_secs()),
        ),
        ForwardError::BackendUnreachable(_) => {
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        ForwardError::TooManyRedirects(_) => {
            json_error_response(ProxyErrorCode::TooManyRedirects, "Backend redirected too many times")
        }
        ForwardError::InvalidTarget(_) => {
            json_error_response(ProxyErrorCode::InvalidTarget, "Request target not supported")
        }
    }
}

/// The front-end HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<ProxyHandler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
        }
    }

    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(handle_connection(stream, addr, handler));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, handler: Arc<ProxyHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    // Dropping the service future on disconnect also drops the outbound request
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    let result = AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await;

    if let Err(e) = result {
        match client_gone(&*e) {
            Some(gone) => debug!(addr = %addr, error = %gone, "Response not delivered"),
            None => debug!(addr = %addr, error = %e, "Connection error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::forward::ForwarderConfig;
    use crate::supervisor::{ExitFuture, LaunchedProcess, ProcessLauncher};
    use futures::FutureExt;
    use http_body_util::{BodyExt, Full};
    use hyper::StatusCode;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLauncher {
        launches: AtomicUsize,
        fail: bool,
    }

    impl ProcessLauncher for CountingLauncher {
        fn launch(&self, _config: &BackendConfig) -> io::Result<LaunchedProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not executable"));
            }
            let exited: ExitFuture = futures::future::pending().boxed();
            Ok(LaunchedProcess { pid: None, exited })
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn handler(port: u16, fail: bool, max_body_bytes: usize) -> (ProxyHandler, Arc<CountingLauncher>) {
        handler_with(BackendConfig::new("manage.py", port), fail, max_body_bytes)
    }

    fn handler_with(
        config: BackendConfig,
        fail: bool,
        max_body_bytes: usize,
    ) -> (ProxyHandler, Arc<CountingLauncher>) {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
            fail,
        });
        let forwarder = RequestForwarder::new(ForwarderConfig {
            base_url: config.base_url(),
            timeout: Duration::from_secs(5),
            max_redirects: 10,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
        })
        .unwrap();
        let supervisor = BackendSupervisor::with_launcher(config, launcher.clone());
        (
            ProxyHandler::new(supervisor, Arc::new(forwarder), max_body_bytes),
            launcher,
        )
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_failure_response_mapping() {
        let timeout = ForwardError::BackendUnreachable(BackendFailure::Timeout(Duration::from_secs(30)));
        let response = failure_response(&timeout, None);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "REQUEST_TIMEOUT");

        let response = failure_response(&ForwardError::TooManyRedirects(10), None);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "TOO_MANY_REDIRECTS");

        let response = failure_response(&ForwardError::InvalidTarget("*".to_string()), None);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_start_failure_takes_precedence_when_unreachable() {
        let spawn_failed = SupervisorError::SpawnFailed {
            command: "manage.py".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        let timeout = ForwardError::BackendUnreachable(BackendFailure::Timeout(Duration::from_secs(1)));

        let response = failure_response(&timeout, Some(&spawn_failed));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_START_FAILED"
        );

        // Redirect loops are the backend's fault even if the launch failed
        let response = failure_response(&ForwardError::TooManyRedirects(10), Some(&spawn_failed));
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "TOO_MANY_REDIRECTS");
    }

    #[tokio::test]
    async fn test_cold_start_without_listener_is_bad_gateway() {
        let (handler, launcher) = handler(closed_port().await, false, 1024);

        let response = handler.handle(get("/items?id=5")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        // Generic message only
        let body = body_string(response).await;
        assert!(body.contains("Failed to connect to backend"));
        assert!(!body.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_spawn_failure_and_unreachable_backend() {
        let (handler, launcher) = handler(closed_port().await, true, 1024);

        let response = handler.handle(get("/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "BACKEND_START_FAILED"
        );

        // The next request tries to start the backend again
        handler.handle(get("/")).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_readiness_wait_is_bounded() {
        let mut config = BackendConfig::new("manage.py", closed_port().await);
        config.ready_timeout_ms = 200;
        let (handler, _launcher) = handler_with(config, false, 1024);

        let start = std::time::Instant::now();
        let response = handler.handle(get("/")).await;

        // Waited for the port, then forwarded anyway
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        // Already running: no second wait
        let start = std::time::Instant::now();
        handler.handle(get("/")).await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    /// Counts error-level events
    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_logged_once() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tracing_subscriber::layer::SubscriberExt;

        // Backend started some other way: answers every connection with 200
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            }
        });

        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (handler, launcher) = handler(port, true, 1024);
        let response = handler.handle(get("/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let (handler, _launcher) = handler(closed_port().await, false, 8);

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Full::new(Bytes::from_static(b"way more than eight bytes")))
            .unwrap();

        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "PAYLOAD_TOO_LARGE");
    }
}
