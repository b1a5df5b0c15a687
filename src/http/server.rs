//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Create the Axum app: one fallback handler behind the middleware stack
//! - Wire up middleware (request ID, tracing)
//! - Buffer request bodies up to the configured limit
//! - Hand each request to the routing engine and start its reply
//! - Bind the listener (plain or TLS) and drain pending replies on shutdown
//!
//! # Data Flow
//! ```text
//! axum request
//!     → RequestContext (decoded segments, query, headers)
//!     → Router::resolve → buffer body unless the route streams it
//!     → Router::dispatch → ResponseState
//!     → ResponseState::start(ChannelWriter)
//!     → ChannelReceiver::into_http → axum response (body may stay open)
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ServerConfig, TlsConfig};
use crate::error::ListenerError;
use crate::handlers;
use crate::http::request::{RequestBody, RequestContext};
use crate::http::writer::ChannelWriter;
use crate::lifecycle::{PendingResponses, ResponseState, Shutdown};
use crate::net::tls::load_tls_config;
use crate::net::{Listener, NetError};
use crate::observability::metrics;
use crate::routing::{BodyMode, RouteError, Router};
use crate::security::{AccessCheck, ReadOnlyAccess};
use crate::store::{DatabaseManager, MemoryReplicator, MemoryStore, Replicator};

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid route table: {0}")]
    Routes(#[from] RouteError),

    #[error("store setup failed: {0}")]
    Store(#[from] ListenerError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Shared state handed to every request.
#[derive(Clone)]
pub struct ListenerState {
    pub manager: Arc<dyn DatabaseManager>,
    pub replicator: Arc<dyn Replicator>,
    pub router: Arc<Router>,
    pub registry: Arc<PendingResponses>,
    pub config: Arc<ArcSwap<ServerConfig>>,
    pub shutdown: Arc<Shutdown>,
}

impl ListenerState {
    pub fn new(
        config: Arc<ArcSwap<ServerConfig>>,
        manager: Arc<dyn DatabaseManager>,
        replicator: Arc<dyn Replicator>,
    ) -> Result<Self, ServerError> {
        let access: Arc<dyn AccessCheck> = Arc::new(ReadOnlyAccess::new(config.clone()));
        let router = Router::new(handlers::routes(), Some(access))?;
        Ok(Self {
            manager,
            replicator,
            router: Arc::new(router),
            registry: Arc::new(PendingResponses::new()),
            config,
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    /// State backed by the in-memory store, with `config.databases` created.
    pub fn in_memory(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DatabaseManager> =
            Arc::new(MemoryStore::with_databases(&config.databases)?);
        let replicator: Arc<dyn Replicator> = Arc::new(MemoryReplicator::new(store.clone()));
        Self::new(Arc::new(ArcSwap::from_pointee(config)), store, replicator)
    }
}

/// Build the Axum app with all middleware layers.
pub fn build_app(state: ListenerState) -> axum::Router {
    axum::Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Every request lands here.
async fn handle(State(state): State<ListenerState>, request: Request) -> axum::response::Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let mut ctx = RequestContext::new(
        parts.method,
        parts.uri.path(),
        parts.uri.query(),
        parts.headers,
        RequestBody::Stream(Some(body)),
        state.clone(),
    );
    let method = ctx.method.to_string();

    let route = state.router.resolve(&ctx.method, &ctx.segments);
    tracing::debug!(
        request_id = %ctx.request_id,
        method = %ctx.method,
        path = %ctx.path,
        route = route.map(|r| r.name).unwrap_or("none"),
        "Dispatching request"
    );

    let streamed = route.is_some_and(|r| r.body == BodyMode::Streamed);
    let limit = ctx.config().limits.max_body_size;
    let buffered = if streamed {
        Ok(())
    } else {
        ctx.buffer_body(limit).await
    };
    let reply = match buffered {
        Ok(()) => state.router.dispatch(route, &mut ctx),
        Err(err) => {
            tracing::debug!(request_id = %ctx.request_id, limit, "Request body refused");
            let mut response = ctx.response();
            response.set_error(&err);
            ResponseState::Immediate(response)
        }
    };

    let (writer, receiver) = ChannelWriter::pair(ctx.config().limits.max_queued_output);
    reply.start(Box::new(writer), &state.registry, &state.shutdown);

    let response = match receiver.into_http().await {
        Some(response) => response,
        None => {
            tracing::error!(request_id = %ctx.request_id, "Reply ended without a head");
            (StatusCode::INTERNAL_SERVER_ERROR, Body::empty()).into_response()
        }
    };
    metrics::record_request(&method, response.status().as_u16(), started.elapsed());
    response
}

/// The listener: serves until shutdown, then drains pending replies.
pub struct ListenerServer {
    state: ListenerState,
}

impl ListenerServer {
    pub fn new(state: ListenerState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ListenerState {
        &self.state
    }

    /// Bind per configuration and serve.
    pub async fn run(self) -> Result<(), ServerError> {
        let config = self.state.config.load_full();
        match &config.listener.tls {
            Some(tls) => self.serve_tls(tls, &config.listener.bind_address).await,
            None => {
                let listener = Listener::bind(&config.listener).await?;
                self.serve(listener).await
            }
        }
    }

    /// Serve plain HTTP on an already-bound listener.
    pub async fn serve(self, listener: Listener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            max_connections = listener.max_connections(),
            "HTTP listener starting"
        );

        let app = build_app(self.state.clone());
        let shutdown = self.state.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        });
        self.drain(server, || {}).await
    }

    /// Serve HTTPS via axum-server.
    async fn serve_tls(self, tls: &TlsConfig, bind_address: &str) -> Result<(), ServerError> {
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            NetError::Bind(io::Error::new(io::ErrorKind::InvalidInput, format!("{}", e)))
        })?;
        let rustls = load_tls_config(tls).await?;
        tracing::info!(address = %addr, "HTTPS listener starting");

        let app = build_app(self.state.clone());
        let handle = axum_server::Handle::new();
        let server_handle = handle.clone();
        let server = tokio::spawn(async move {
            axum_server::bind_rustls(addr, rustls)
                .handle(server_handle)
                .serve(app.into_make_service())
                .await
        });
        let drain = self.drain_timeout();
        self.drain(server, move || handle.graceful_shutdown(Some(drain)))
            .await
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.state.config.load().shutdown.drain_timeout_secs)
    }

    /// Wait for shutdown, then give pending replies the drain timeout.
    async fn drain<F>(
        &self,
        mut server: JoinHandle<io::Result<()>>,
        on_shutdown: F,
    ) -> Result<(), ServerError>
    where
        F: FnOnce(),
    {
        tokio::select! {
            result = &mut server => return joined(result),
            _ = self.state.shutdown.wait() => {}
        }
        on_shutdown();

        let registry = self.state.registry.clone();
        let timeout = self.drain_timeout();
        tracing::info!(
            pending = registry.len(),
            drain_timeout_secs = timeout.as_secs(),
            "Draining pending responses"
        );

        let drained = tokio::time::timeout(timeout, async {
            registry.wait_until_empty().await;
            (&mut server).await
        })
        .await;

        match drained {
            Ok(result) => {
                tracing::info!("HTTP listener stopped");
                joined(result)
            }
            Err(_) => {
                tracing::warn!(
                    pending = registry.len(),
                    "Drain timeout elapsed, dropping remaining connections"
                );
                server.abort();
                Ok(())
            }
        }
    }
}

fn joined(result: Result<io::Result<()>, tokio::task::JoinError>) -> Result<(), ServerError> {
    result.map_err(io::Error::other)??;
    Ok(())
}
