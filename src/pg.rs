use std::time::Duration;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::info;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{query, Row};

use crate::error::DbError;
use crate::query::{QueryExecutor, TileQuery};
use crate::{Tile, Xyz};

/// Opens the connection pool and makes sure the database answers.
pub async fn connect(
    connection_string: &str,
    pool_size: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(acquire_timeout)
        .connect(connection_string)
        .await?;

    let version: String = query("SELECT version()").fetch_one(&pool).await?.try_get(0)?;
    info!("Connected to {version} with up to {pool_size} connections");

    Ok(pool)
}

fn payload(row: PgRow) -> Result<Tile, sqlx::Error> {
    // A NULL tile is what ST_AsMVT returns for some empty inputs
    let tile: Option<Tile> = row.try_get(0)?;
    Ok(tile.unwrap_or_default())
}

impl QueryExecutor for PgPool {
    fn fetch_rows<'a>(
        &'a self,
        tile_query: &'a TileQuery,
        xyz: Xyz,
    ) -> BoxStream<'a, Result<Tile, DbError>> {
        let prepared = tile_query
            .bindings(xyz)
            .into_iter()
            .fold(query(tile_query.sql()), |acc, value| acc.bind(value));

        prepared
            .fetch(self)
            .and_then(|row| futures::future::ready(payload(row)))
            .map_err(DbError::from)
            .boxed()
    }
}
