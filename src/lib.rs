//! # Tile Recipes
//!
//! Serve Mapbox vector tiles straight out of PostGIS, driven by declarative recipes.
//!
//! ## Current features
//!
//! A recipe is a small YAML document describing one tile source: its name, zoom range,
//! bounds, the vector layers it publishes, and one SQL template per zoom key (`z7`, `z*`, ...).
//! Given a directory of recipes and a PostGIS database, this crate will
//!
//! * validate every recipe once at startup and freeze them in a [`registry::SourceRegistry`],
//! * pick the right SQL template for a requested zoom (an exact `z<N>` key always beats `z*`),
//! * bind the tile coordinates as query parameters and return the single MVT payload row,
//! * publish a TileJSON 3.0.0 document for each source.
//!
//! ## Known Limitations
//!
//! Tiles are neither rendered, simplified, nor cached here: the SQL in the recipe is expected
//! to produce a finished MVT blob (typically via `ST_AsMVT`). Recipes are only read at startup,
//! so changing them requires a restart.
//!
//! The trait-based design allows for further extensibility, so other (non-relational) source
//! kinds can be added without touching the registry or the HTTP layer.

use std::fmt::{self, Debug, Display};

// TODO: remove once async fn in traits can be used through `dyn`
use async_trait::async_trait;

use tilejson::TileJSON;
use tokio_util::sync::CancellationToken;

use crate::error::TileResult;
use crate::query::QueryExecutor;

pub mod config;
pub mod error;
pub mod loader;
pub mod pg;
pub mod query;
pub mod recipe;
pub mod registry;
pub mod srv;
pub mod zoom;

/// Raw MVT bytes. An empty tile is a perfectly valid tile.
pub type Tile = Vec<u8>;

/// Highest zoom level a recipe may declare.
pub const MAX_ZOOM: u8 = 30;

/// A slippy map tile address in XYZ format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Xyz {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Xyz {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Whether `x` and `y` address a tile that exists at zoom `z`.
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let tiles = 1u64 << self.z;
        u64::from(self.x) < tiles && u64::from(self.y) < tiles
    }

    /// Longitude and latitude of the north-west corner of the tile.
    pub fn lon_lat(&self) -> (f64, f64) {
        slippy_map_tilenames::tile2lonlat(self.x, self.y, self.z)
    }
}

impl Display for Xyz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// This is the main trait exported by this crate. Every kind of tile source stored in the
/// registry implements it, and the HTTP layer only ever talks to sources through it.
#[async_trait]
pub trait TileSource: Debug + Send + Sync {
    /// Unique identifier of the source, used in URLs.
    fn id(&self) -> &str;

    /// Inclusive zoom range the source can serve.
    fn zoom_range(&self) -> (u8, u8);

    /// Builds the TileJSON document advertised for this source. `base_url` is the externally
    /// visible URL of the source itself, tiles are addressed as `{base_url}/{z}/{x}/{y}`.
    fn tilejson(&self, base_url: &str) -> TileJSON;

    /// Renders the Mapbox vector tile for a slippy map tile in XYZ format.
    async fn get_tile(
        &self,
        db: &dyn QueryExecutor,
        xyz: Xyz,
        cancel: &CancellationToken,
    ) -> TileResult<Tile>;
}
