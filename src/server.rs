use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::handlers::{explain, health_check, rate_limit_status, AppState};
use crate::middleware::logging_middleware;
use crate::throttle::{spawn_sweeper, Throttle};
use crate::upstream::GeminiClient;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router over an already constructed state.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/explain", post(explain))
        .route("/api/rate-limit-status", get(rate_limit_status))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        config.check()?;

        let throttle = Arc::new(Throttle::with_settings(config.throttle_settings()));
        let generator = Arc::new(GeminiClient::new(
            &config.gemini_base_url,
            &config.gemini_model,
            config.upstream_timeout(),
        )?);
        let state = AppState::new(throttle, generator, config.gemini_api_key.clone());

        Ok(Self { config, state })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                GatewayError::Internal(format!("Failed to bind {}: {}", self.config.bind_addr, e))
            })?;

        let settings = self.state.throttle.settings();
        tracing::info!(
            bind_addr = %self.config.bind_addr,
            limit = settings.limit,
            cooldown = %humantime::format_duration(settings.cooldown),
            retention = %humantime::format_duration(settings.retention),
            "Persona gateway starting"
        );

        let sweeper = spawn_sweeper(self.state.throttle.clone(), self.config.sweep_interval());
        let app = create_app(self.state);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper.abort();
        tracing::info!("Persona gateway stopped");

        served.map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
