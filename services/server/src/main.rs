use std::env;
use std::sync::Arc;

use server::hub::Hub;
use server::media::rtc::RtcMediaStack;
use server::{db, repo, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let stun_url = env::var("STUN_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.to_owned());

    let pool = db::connect(&database_url).await;
    db::migrate(&pool).await;
    info!("database ready");

    // No client is connected at startup; clear any online/busy rows left by
    // an unclean shutdown.
    match repo::users::reset_statuses(&pool).await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "reset stale user statuses"),
        Err(e) => warn!(error = %e, "failed to reset user statuses"),
    }

    let media = Arc::new(RtcMediaStack::new(stun_url).expect("media stack init failed"));
    let hub = Hub::new(pool.clone(), media);
    hub.load_user_statuses().await;
    tokio::spawn(Arc::clone(&hub).run());

    let state = AppState::new(pool, hub);
    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("could not bind listen address");
    info!(addr = %bind_addr, "accepting connections");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("http server failed");
    info!("shutdown complete");
}

/// Resolves once the process is asked to stop, reporting which signal did
/// it.  SIGTERM only exists on unix; elsewhere Ctrl+C is the sole trigger.
async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("SIGINT handler installation failed");
        "SIGINT"
    };

    #[cfg(unix)]
    let term = async {
        let mut stream =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installation failed");
        stream.recv().await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<&str>();

    let signal = tokio::select! {
        name = interrupt => name,
        name = term => name,
    };
    info!(signal, "shutdown requested");
}
