use std::sync::Arc;

use tracing::info;

use support_desk::app::{self, AppState};
use support_desk::config::{Config, StoreBackend};
use support_desk::error::AppError;
use support_desk::store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let config = Config::from_env();
    let store = open_store(&config).await?;
    let state = Arc::new(AppState::new(store, config.notifications));
    let app = app::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        port = config.port,
        backend = ?config.store_backend,
        "support desk server running at http://localhost:{}",
        config.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>, AppError> {
    match (config.store_backend, config.database_url.as_deref()) {
        (StoreBackend::Postgres, Some(url)) => {
            let store = PgStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            info!("postgres store ready");
            Ok(Arc::new(store))
        }
        (StoreBackend::Postgres, None) => Err(AppError::Internal(
            "STORE_BACKEND=postgres needs DATABASE_URL or POSTGRES_* settings".into(),
        )),
        (StoreBackend::Memory, _) => {
            info!("using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let default_filter = if cfg!(debug_assertions) {
        "debug,support_desk=debug,sqlx=info,tower_http=debug,hyper=info"
    } else {
        "info,support_desk=info,sqlx=warn,tower_http=info,hyper=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
