//! HTTP server for the admission API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{self, AppState, ISSUES_PATH};
use crate::error::Result;

/// HTTP server owning the listen address and the shared application state.
pub struct ApiServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new server bound to `addr`.
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Build the admission router.
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/v1/healthz", get(handlers::health))
            .route("/v1/feedback/challenge", post(handlers::issue_challenge))
            .route(ISSUES_PATH, post(handlers::submit_ticket))
            .route(
                &format!("{}/:issue_number", ISSUES_PATH),
                get(handlers::ticket_status),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(self.state);
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting admission API server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::security::{ChallengeManager, DuplicateDetector, FixedWindowLimiter};
    use crate::store::TicketStore;
    use crate::tracker::IssueClient;

    #[test]
    fn router_construction() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::default();

        let state = Arc::new(AppState {
            challenges: ChallengeManager::new(
                config.security.challenge_ttl(),
                config.security.timestamp_skew(),
                config.security.signature_fail_threshold,
                config.security.signature_block_duration(),
            ),
            limiter: Arc::new(FixedWindowLimiter::new()),
            dedupe: Arc::new(DuplicateDetector::new()),
            tracker: IssueClient::new("token", "owner", "repo"),
            tickets: TicketStore::open(dir.path()).unwrap(),
            config,
        });

        let _router = ApiServer::router(state);
    }
}
