use std::process;

use dotenvy::dotenv;
use lecture_poll::{config::Config, db::PgStore, memory::MemoryStore, start_server};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenv().ok(); // Load environment variables from .env file

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            process::exit(1);
        }
    };

    let served = match config.database_url.clone() {
        Some(database_url) => {
            info!("Connecting to the database...");
            let store = match PgStore::connect(&database_url, config.db_max_connections).await {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to connect to the database: {e}");
                    process::exit(1);
                }
            };
            start_server(store, config).await
        }
        None => {
            warn!("DATABASE_URL not set, keeping state in memory");
            start_server(MemoryStore::new(), config).await
        }
    };

    if let Err(e) = served {
        error!("Server error: {e}");
        process::exit(1);
    }
}
