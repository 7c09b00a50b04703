use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::http::HeaderValue;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use pix_commerce_api as api;

// Above the longest allowed provider timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
use pix_commerce_api::services::{
    payment_poller::PaymentPoller,
    payment_provider::{GuardedProvider, HttpPixProvider, PaymentProvider},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);
    api::metrics::install()?;

    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await?;
    }
    let db_arc = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(event_rx));

    // Payment provider behind timeout and circuit breaker
    if cfg.payment_provider_token.is_none() {
        warn!("APP__PAYMENT_PROVIDER_TOKEN is not set; PIX charges will be rejected by the provider");
    }
    let http_provider: Arc<dyn PaymentProvider> = Arc::new(HttpPixProvider::from_config(&cfg)?);
    let provider: Arc<dyn PaymentProvider> =
        Arc::new(GuardedProvider::from_config(http_provider, &cfg));

    let auth_service = Arc::new(api::auth::AuthService::new(
        &cfg.jwt_secret,
        cfg.jwt_expiration,
    ));

    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        provider,
        auth_service,
    );

    // Fallback for lost webhooks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_handle = if cfg.payment_poll_interval_secs > 0 {
        let poller = PaymentPoller::new(
            services.orders.clone(),
            services.payments.clone(),
            Duration::from_secs(cfg.payment_poll_interval_secs),
        );
        Some(tokio::spawn(poller.run(shutdown_rx)))
    } else {
        info!("Payment polling disabled");
        None
    };

    let cors = cors_layer(&cfg)?;

    let app_state = api::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        event_sender,
        services,
    };

    let app = api::app_router(app_state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!(%addr, environment = %cfg.environment, "pix-commerce-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = poller_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Payment poller task ended abnormally");
        }
    }
    info!("pix-commerce-api stopped");

    Ok(())
}

/// Explicit origins from `cors_allowed_origins`; anything goes only in
/// development.
fn cors_layer(cfg: &api::config::AppConfig) -> Result<CorsLayer, Box<dyn std::error::Error>> {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(HeaderValue::from_str)
        .collect::<Result<_, _>>()?;

    if !origins.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    if cfg.is_development() {
        info!("No CORS origins configured; allowing any origin in development");
        return Ok(CorsLayer::permissive());
    }
    error!(environment = %cfg.environment, "APP__CORS_ALLOWED_ORIGINS is required");
    Err("missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS".into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down, draining in-flight requests");
}
