use std::io;

use clap::Parser;
use log::{error, info, warn};
use tile_recipes::config::{Args, Config};
use tile_recipes::loader::load_recipes;
use tile_recipes::pg;
use tile_recipes::registry::SourceRegistry;
use tile_recipes::srv::{new_server, AppState};
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[actix_web::main]
async fn main() -> io::Result<()> {
    let env = env_logger::Env::default().default_filter_or("tile_recipes=info,actix_web=info");
    env_logger::Builder::from_env(env).init();

    info!("Starting tile_recipes v{VERSION}");

    let config = Config::load(Args::parse()).map_err(|e| {
        error!("{e}");
        io::Error::other(e)
    })?;

    // Sources are frozen before the server accepts anything
    let (registry, duplicates) = SourceRegistry::build(load_recipes(&config.recipe_dir));
    if !duplicates.is_empty() {
        warn!("Ignored {} duplicate source definitions", duplicates.len());
    }
    if registry.is_empty() {
        warn!("No sources found in {}", config.recipe_dir.display());
    }
    info!("Found {} sources: {:?}", registry.len(), registry.list_ids());

    let pool = pg::connect(
        &config.connection_string,
        config.pool_size,
        config.pool_timeout,
    )
    .await
    .map_err(|e| {
        error!("Unable to connect to the database: {e}");
        io::Error::other(e)
    })?;

    let shutdown = CancellationToken::new();
    let state = AppState {
        registry,
        db: Box::new(pool.clone()),
        query_timeout: config.query_timeout,
        shutdown: shutdown.clone(),
    };

    let server = new_server(&config, state).map_err(|e| {
        error!("Unable to listen on {}: {e}", config.listen_addresses);
        e
    })?;
    info!("Listening on {}", config.listen_addresses);

    let result = server.await;

    info!("Shutting down");
    shutdown.cancel();
    pool.close().await;
    info!("Server stopped");

    result
}
