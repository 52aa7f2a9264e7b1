use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub notifications: NotificationLimits,
}

/// Bounds applied when the notification feed is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationLimits {
    /// Maximum entries in the merged feed.
    pub feed: usize,
    /// Maximum waiting chats and new contact messages fetched per source.
    pub per_source: usize,
}

impl Default for NotificationLimits {
    fn default() -> Self {
        Self {
            feed: 10,
            per_source: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let port = env_parse("PORT").unwrap_or(4000);
        let database_url = resolve_database_url();
        let store_backend = match env::var("STORE_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") => StoreBackend::Postgres,
            _ if database_url.is_some() => StoreBackend::Postgres,
            _ => StoreBackend::Memory,
        };
        let defaults = NotificationLimits::default();

        Self {
            port,
            store_backend,
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            notifications: NotificationLimits {
                feed: env_parse("NOTIFICATION_LIMIT").unwrap_or(defaults.feed),
                per_source: env_parse("NOTIFICATION_SOURCE_LIMIT").unwrap_or(defaults.per_source),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// `DATABASE_URL` wins; otherwise the URL is assembled from the
/// `POSTGRES_*` / libpq `PG*` variables when a host or database is named.
fn resolve_database_url() -> Option<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return Some(url);
        }
    }
    let host = env::var("POSTGRES_HOST").or_else(|_| env::var("PGHOST")).ok();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .ok();
    if host.is_none() && db.is_none() {
        return None;
    }
    let host = host.unwrap_or_else(|| "localhost".to_string());
    let db = db.unwrap_or_else(|| "support_desk".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}
