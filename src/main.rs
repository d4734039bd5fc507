use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use wavr::config::{AppConfig, AuthConfig};
use wavr::identity::{GoTrueClient, IdentityProvider, InMemoryIdentityProvider};
use wavr::local::LocalStorage;
use wavr::routes::{AppState, router};
use wavr::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("🎛  wavr v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind_addr);
    eprintln!("   Site URL: {}", config.site_url);

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let db: Arc<dyn Database> = backend.clone();
    let storage: Arc<dyn LocalStorage> = backend;
    eprintln!("   Database: {}", config.db_path.display());

    // ── Identity provider ────────────────────────────────────────────────
    let provider: Arc<dyn IdentityProvider> = match &config.auth {
        AuthConfig::Remote { url, anon_key } => {
            eprintln!("   Auth: {url}");
            Arc::new(GoTrueClient::new(url.clone(), anon_key.clone()))
        }
        AuthConfig::InMemory {
            require_confirmation,
        } => {
            eprintln!("   Auth: in-memory (confirmation links are logged)");
            let provider = InMemoryIdentityProvider::new();
            provider.set_require_confirmation(*require_confirmation);
            Arc::new(provider)
        }
    };

    if config.admin_emails.is_empty() {
        tracing::warn!("WAVR_ADMIN_EMAILS is empty; the admin area is closed");
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = AppState::new(db, storage, provider, &config);
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "wavr server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
