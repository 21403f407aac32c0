use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use tally_config::{Config, ConfigError};
use tally_log::LogError;
use tally_system::{Shutdown, ShutdownHandle};
use tokio::net::TcpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::{CompressionLayer, DefaultPredicate, Predicate};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use crate::middlewares::{self, CatchPanicLayer, NormalizePath};
use crate::service::{ServiceError, ServiceState};

/// Value of the `Server` response header.
const SERVER: &str = concat!("tally/", env!("CARGO_PKG_VERSION"));

/// Set a timeout for reading client request headers. If a client does not transmit the entire
/// header within this time, the connection is closed.
const CLIENT_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Only compress responses above this configured size, in bytes.
const COMPRESSION_MIN_SIZE: u16 = 128;

/// Number of pending connections the listening socket queues.
const LISTEN_BACKLOG: u32 = 1024;

/// Indicates the type of failure of the server.
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),

    /// The listen address is not valid.
    #[error("invalid listen address")]
    InvalidAddress(#[from] ConfigError),

    /// Storage or audit sinks could not be set up.
    #[error("failed to start services")]
    ServiceFailed(#[from] ServiceError),
}

type App = NormalizePath<axum::Router>;

/// Aborts requests running longer than `timeout`.
///
/// Answers 503 rather than 408, since agents only retry server errors.
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::SERVICE_UNAVAILABLE, timeout)
}

/// Build the axum application with all routes and middleware.
fn make_app(service: ServiceState) -> App {
    let config = service.config();

    // Build the router middleware into a single service which runs _after_ routing. Service
    // builder order defines layers added first will be called first. This means:
    //  - Requests go from top to bottom
    //  - Responses go from bottom to top
    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(middlewares::handle_panic))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER),
        ))
        .layer(middlewares::trace_http_layer())
        .layer(timeout_layer(config.request_timeout()))
        .layer(
            CompressionLayer::new()
                .compress_when(SizeAbove::new(COMPRESSION_MIN_SIZE).and(DefaultPredicate::new())),
        );

    let router = crate::endpoints::routes(config)
        .layer(middleware)
        .with_state(service);

    // Add middlewares that need to run _before_ routing, which need to wrap the router. This are
    // especially middlewares that modify the request path for the router:
    NormalizePath::new(router)
}

fn listen(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?.into_std()?)
}

async fn serve(
    listener: TcpListener,
    app: App,
    mut shutdown: ShutdownHandle,
) -> std::io::Result<()> {
    let handle = Handle::new();

    let mut server = axum_server::from_tcp(listener).handle(handle.clone());

    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .half_close(true)
        .keep_alive(true)
        .header_read_timeout(CLIENT_HEADER_TIMEOUT);

    let service = ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app);

    tokio::spawn(async move {
        let Shutdown { timeout } = shutdown.notified().await;
        tally_log::info!("shutting down HTTP server");

        match timeout {
            Some(timeout) => handle.graceful_shutdown(Some(timeout)),
            None => handle.shutdown(),
        }
    });

    server.serve(service).await
}

/// Periodically writes the memory store snapshot until shutdown.
async fn flush_periodically(service: ServiceState, period: Duration, mut shutdown: ShutdownHandle) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                if let Err(error) = service.engine().flush().await {
                    tally_log::error!("failed to flush metrics: {}", LogError(&error));
                }
            }
        }
    }
}

/// HTTP server service.
///
/// This is the main HTTP server which hosts all endpoints and dispatches incoming traffic to
/// them. The server stops when a [`Shutdown`] is triggered and drains open connections for the
/// duration of the shutdown timeout.
pub struct HttpServer {
    config: Arc<Config>,
    service: ServiceState,
    listener: TcpListener,
}

impl HttpServer {
    /// Binds the listen address of the config.
    pub fn new(config: Arc<Config>, service: ServiceState) -> Result<Self, ServerError> {
        let listener = listen(config.listen_addr()?)?;

        Ok(Self {
            config,
            service,
            listener,
        })
    }

    /// Returns the address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until shutdown and writes a final snapshot afterwards.
    pub async fn run(self, shutdown: ShutdownHandle) -> Result<(), ServerError> {
        let Self {
            config,
            service,
            listener,
        } = self;

        tally_log::info!("spawning http server");
        tally_log::info!("  listening on http://{}/", listener.local_addr()?);

        let flusher = config.store_interval().map(|period| {
            tally_log::debug!("flushing metrics every {period:?}");
            tokio::spawn(flush_periodically(service.clone(), period, shutdown.clone()))
        });

        let result = serve(listener, make_app(service.clone()), shutdown).await;

        if let Some(flusher) = flusher {
            flusher.abort();
        }

        if let Err(error) = service.engine().flush().await {
            tally_log::error!("failed to flush metrics on shutdown: {}", LogError(&error));
        }

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use similar_asserts::assert_eq;
    use tally_metrics::Metric;
    use tally_system::Controller;
    use tower::ServiceExt as _;

    use super::*;
    use crate::services::audit::AuditLogger;
    use crate::services::engine::UpsertEngine;
    use crate::store::{MemoryStore, MetricStore, Storage};

    fn service(config: serde_json::Value) -> ServiceState {
        let config = Arc::new(Config::from_json_value(config).unwrap());
        let engine = UpsertEngine::new(Storage::Memory(Arc::new(MemoryStore::new())));
        ServiceState::new(config, engine, AuditLogger::disabled())
    }

    #[tokio::test]
    async fn test_app_normalizes_path() {
        let app = make_app(service(serde_json::json!({})));

        let request = Request::post("//update//counter/Requests/5/")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::SERVER], SERVER);

        let request = Request::get("/value/counter/Requests/")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_server_error() {
        let app = axum::Router::new()
            .route(
                "/updates",
                axum::routing::post(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    StatusCode::OK
                }),
            )
            .layer(timeout_layer(Duration::from_secs(15)));

        let request = Request::post("/updates").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        tally_log::init_test!();

        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("metrics.json");

        let config = Arc::new(
            Config::from_json_value(serde_json::json!({
                "server": {
                    "address": "127.0.0.1:0",
                    "store_interval": 3600,
                    "file_storage_path": snapshot,
                },
            }))
            .unwrap(),
        );

        let (service, audit) = ServiceState::start(config.clone()).await.unwrap();
        let server = HttpServer::new(config, service.clone()).unwrap();
        let addr = server.local_addr().unwrap();

        let controller = Controller::new();
        let task = tokio::spawn(server.run(controller.shutdown_handle()));

        let encoded = tally_metrics::encode(&[Metric::counter("Requests", 5)], None).unwrap();
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/updates"))
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(encoded.payload)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        controller.trigger_shutdown(Some(Duration::from_secs(1)));
        task.await.unwrap().unwrap();

        drop(service);
        audit.finish(Duration::from_secs(1)).await;

        let restored = MemoryStore::with_snapshot(&snapshot, false, true)
            .await
            .unwrap();
        assert_eq!(
            restored.get("Requests").await.unwrap(),
            Some(Metric::counter("Requests", 5))
        );
    }
}
