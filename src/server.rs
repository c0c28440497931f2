//! HTTP server bound to a [`Lifecycle`].
//!
//! [`serve`] binds the listener, then runs the accept loop as a lifecycle
//! dependent. When the lifecycle is stopped the server stops accepting new
//! connections and lets in-flight requests finish; because the accept loop is
//! a registered task, [`Lifecycle::wait`] does not return until the server has
//! reached [`ServerState::Stopped`].
//!
//! # Example
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use fetchkit_core::Lifecycle;
//! use fetchkit_core::server::{ServeOptions, serve};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let lifecycle = Lifecycle::new();
//! let router = Router::new().route("/", get(|| async { "hello" }));
//! let handle = serve(&lifecycle, ServeOptions::new("127.0.0.1:0", router)).await?;
//! println!("listening on {}", handle.local_addr());
//!
//! lifecycle.stop();
//! lifecycle.wait().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::lifecycle::Lifecycle;

/// Default listen address for the CLI `serve` command.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Server state, in the only order it can advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Not yet bound.
    NotStarted,
    /// Listener bound and accepting connections.
    Listening,
    /// Lifecycle stop observed; draining in-flight requests.
    ShuttingDown,
    /// Accept loop exited. Terminal.
    Stopped,
}

/// Errors raised while starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The lifecycle was already stopping when the server was registered.
    #[error("lifecycle is stopping, refusing to start server on {addr}")]
    LifecycleStopped {
        /// Requested address
        addr: String,
    },
}

/// Where to listen and what to serve.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Listen address, e.g. `127.0.0.1:8080`. Port `0` picks a free port.
    pub addr: String,
    /// Request handler.
    pub router: Router,
}

impl ServeOptions {
    /// Creates options for `addr` serving `router`.
    #[must_use]
    pub fn new(addr: impl Into<String>, router: Router) -> Self {
        Self {
            addr: addr.into(),
            router,
        }
    }
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self::new(DEFAULT_ADDR, health_router())
    }
}

/// Handle to a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: watch::Receiver<ServerState>,
}

impl ServerHandle {
    /// The bound address, with the real port when `:0` was requested.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current server state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Waits until the server has reached `target` (or any later state) and
    /// returns the state observed.
    pub async fn wait_for_state(&self, target: ServerState) -> ServerState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        // Sender gone: the accept loop has exited.
        reached.unwrap_or_else(|_| *rx.borrow())
    }
}

/// Binds `options.addr` and serves `options.router` until `lifecycle` stops.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the address cannot be bound, and
/// [`ServerError::LifecycleStopped`] if stop was signalled before the
/// server could be registered.
#[instrument(skip_all, fields(addr = %options.addr))]
pub async fn serve(lifecycle: &Lifecycle, options: ServeOptions) -> Result<ServerHandle, ServerError> {
    let ServeOptions { addr, router } = options;

    if lifecycle.is_stopping() {
        return Err(ServerError::LifecycleStopped { addr });
    }

    let listener = TcpListener::bind(addr.as_str())
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    serve_listener(lifecycle, listener, router)
}

/// Serves `router` on an already bound `listener` until `lifecycle` stops.
///
/// # Errors
///
/// Returns [`ServerError::LifecycleStopped`] if stop was already signalled;
/// the listener is dropped in that case.
pub fn serve_listener(
    lifecycle: &Lifecycle,
    listener: TcpListener,
    router: Router,
) -> Result<ServerHandle, ServerError> {
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind {
            addr: "<bound listener>".to_string(),
            source,
        })?;

    // Stop may have landed while the listener was being bound.
    if lifecycle.is_stopping() {
        return Err(ServerError::LifecycleStopped {
            addr: local_addr.to_string(),
        });
    }

    let (state_tx, state_rx) = watch::channel(ServerState::Listening);
    info!(%local_addr, "HTTP server listening");

    let state_tx = Arc::new(state_tx);
    let shutdown_state = Arc::clone(&state_tx);
    let token = lifecycle.child_token();

    lifecycle.spawn("http-server", async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                shutdown_state.send_replace(ServerState::ShuttingDown);
                info!(%local_addr, "HTTP server shutting down");
            })
            .await;

        if let Err(e) = result {
            error!(%local_addr, error = %e, "HTTP server exited with error");
        }
        state_tx.send_replace(ServerState::Stopped);
        info!(%local_addr, "HTTP server stopped");
    });

    Ok(ServerHandle {
        local_addr,
        state: state_rx,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Router exposing `/health` and `/api/v1/health`.
#[must_use]
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/health", get(health_check))
}
