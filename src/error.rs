use std::io;
use std::path::PathBuf;

use crate::Xyz;

pub type TileResult<T> = Result<T, TileError>;
pub type RecipeResult<T> = Result<T, RecipeError>;

/// Problems found while reading recipes at startup. None of them are fatal: the offending
/// recipe is skipped and loading carries on.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("Unable to read recipe {1}: {0}")]
    Io(#[source] io::Error, PathBuf),

    #[error("Unable to walk recipe directory {1}: {0}")]
    Walk(#[source] walkdir::Error, PathBuf),

    #[error("Invalid YAML in recipe: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Malformed recipe {name:?}: {reason}")]
    Malformed { name: String, reason: String },
}

impl RecipeError {
    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// A second source tried to register under an already taken id. The first one stays.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Duplicate source id {0:?}, keeping the first definition")]
pub struct DuplicateSourceId(pub String);

/// Failures reported by a [`crate::query::QueryExecutor`].
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("No database connection available")]
    PoolExhausted,

    #[error(transparent)]
    Query(Box<dyn std::error::Error + Send + Sync>),
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::PoolExhausted,
            e => Self::Query(Box::new(e)),
        }
    }
}

/// Request-time failures. Each one only affects the request that caused it.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("Source {0:?} does not exist")]
    SourceNotFound(String),

    #[error("Zoom {zoom} is outside of [{min_zoom}, {max_zoom}] for source {source_id:?}")]
    ZoomOutOfRange {
        source_id: String,
        zoom: u8,
        min_zoom: u8,
        max_zoom: u8,
    },

    #[error("Source {source_id:?} has no query for zoom {zoom}")]
    NoQueryForZoom { source_id: String, zoom: u8 },

    #[error("Query of source {source_id:?} returned more than one row for tile {xyz}")]
    AmbiguousTileResult { source_id: String, xyz: Xyz },

    #[error("Query of source {source_id:?} failed for tile {xyz}: {cause}")]
    QueryExecution {
        source_id: String,
        xyz: Xyz,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No database connection available for tile {xyz} of source {source_id:?}")]
    PoolExhausted { source_id: String, xyz: Xyz },

    #[error("Tile {xyz} of source {source_id:?} was cancelled")]
    Cancelled { source_id: String, xyz: Xyz },
}

impl TileError {
    pub(crate) fn from_db(e: DbError, source_id: &str, xyz: Xyz) -> Self {
        let source_id = source_id.to_string();
        match e {
            DbError::PoolExhausted => Self::PoolExhausted { source_id, xyz },
            DbError::Query(cause) => Self::QueryExecution {
                source_id,
                xyz,
                cause,
            },
        }
    }
}

/// Startup-time configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read config file {1}: {0}")]
    Io(#[source] io::Error, PathBuf),

    #[error("Invalid YAML in config file {1}: {0}")]
    Yaml(#[source] serde_yaml::Error, PathBuf),

    #[error("A database connection string is required")]
    MissingConnectionString,
}
