use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber;

use ticketgate::api::{ApiServer, AppState};
use ticketgate::config::GatewayConfig;
use ticketgate::security::{
    ChallengeManager, DuplicateDetector, DuplicateDetectorBackend, FixedWindowLimiter,
    RateLimiterBackend, RedisDuplicateDetector, RedisFixedWindowLimiter,
};
use ticketgate::store::TicketStore;
use ticketgate::tracker::IssueClient;

/// Anti-abuse admission gateway for ticket creation.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Ticketgate Admission Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = match args.config.as_deref() {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    config.overlay_env();
    config.validate()?;
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let tracker = IssueClient::new(
        &config.tracker.token,
        &config.tracker.owner,
        &config.tracker.repo,
    );

    let (limiter, dedupe) = select_backends(&config).await;

    let challenges = ChallengeManager::new(
        config.security.challenge_ttl(),
        config.security.timestamp_skew(),
        config.security.signature_fail_threshold,
        config.security.signature_block_duration(),
    );

    let tickets = TicketStore::open(&config.store.data_dir)?;

    let addr = config.server.listen_addr;
    let state = Arc::new(AppState {
        config,
        challenges,
        limiter,
        dedupe,
        tracker,
        tickets,
    });

    // Run the server with graceful shutdown on Ctrl+C or SIGTERM
    ApiServer::new(addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Ticketgate Admission Gateway stopped");
    Ok(())
}

/// Select distributed or local-only enforcement, once, at startup.
///
/// A configured but unreachable Redis degrades to local-only enforcement
/// rather than refusing to start.
async fn select_backends(
    config: &GatewayConfig,
) -> (Arc<dyn RateLimiterBackend>, Arc<dyn DuplicateDetectorBackend>) {
    let Some(url) = config.redis.url.as_deref() else {
        info!("No Redis configured, using local-only enforcement");
        return local_backends();
    };

    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Invalid Redis URL, using local-only enforcement");
            return local_backends();
        }
    };

    let probe = tokio::time::timeout(Duration::from_secs(2), async {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        redis::RedisResult::Ok(pong)
    })
    .await;

    match probe {
        Ok(Ok(_)) => {
            info!("Redis connected, distributed enforcement enabled");
            (
                Arc::new(RedisFixedWindowLimiter::new(
                    client.clone(),
                    config.redis.key_prefix.clone(),
                )) as Arc<dyn RateLimiterBackend>,
                Arc::new(RedisDuplicateDetector::new(
                    client,
                    config.redis.key_prefix.clone(),
                )) as Arc<dyn DuplicateDetectorBackend>,
            )
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Redis unreachable, using local-only enforcement");
            local_backends()
        }
        Err(_) => {
            warn!("Redis ping timed out, using local-only enforcement");
            local_backends()
        }
    }
}

fn local_backends() -> (Arc<dyn RateLimiterBackend>, Arc<dyn DuplicateDetectorBackend>) {
    (
        Arc::new(FixedWindowLimiter::new()) as Arc<dyn RateLimiterBackend>,
        Arc::new(DuplicateDetector::new()) as Arc<dyn DuplicateDetectorBackend>,
    )
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
