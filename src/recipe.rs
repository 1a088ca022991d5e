//! Tile recipe YAML format
//!
//! A recipe describes one tile source backed by SQL templates, one per zoom key:
//!
//! ```yaml
//! name: roads
//! description: Road network
//! schema: public
//! minzoom: 7
//! maxzoom: 14
//! bounds: [-180, -85.0511, 180, 85.0511]
//! vector_layers:
//!   - id: roads
//!     fields: { name: text, lanes: number }
//! sqls:
//!   z7: SELECT ST_AsMVT(t) FROM (... ST_TileEnvelope(:z, :x, :y) ...) AS t
//!   z*: SELECT ST_AsMVT(t) FROM (...) AS t
//! ```

use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde::Deserialize;
use tilejson::{tilejson, Bounds, TileJSON, VectorLayer};

// TODO: remove once async fn in traits can be used through `dyn`
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{RecipeError, RecipeResult, TileResult};
use crate::query::{fetch_tile, QueryExecutor, TileQuery};
use crate::zoom::{ZoomKey, ZoomQueries};
use crate::{Tile, TileSource, Xyz, MAX_ZOOM};

/// Full Web Mercator extent, used when a recipe has no bounds.
pub const WEB_MERCATOR_BOUNDS: [f64; 4] = [-180.0, -85.0511, 180.0, 85.0511];

/// A recipe as written on disk.
#[derive(Clone, Deserialize, Debug)]
pub struct RecipeFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: String,
    pub minzoom: u8,
    pub maxzoom: u8,
    pub bounds: Option<Vec<f64>>,
    pub fillzoom: Option<u8>,
    #[serde(default, alias = "vectorlayers")]
    pub vector_layers: Vec<VectorLayerSchema>,
    /// Deprecated flat field list from early recipes, superseded by per-layer fields.
    pub fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub sqls: BTreeMap<String, String>,
}

/// One logical layer inside a tile. Field types are free-form labels.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct VectorLayerSchema {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A validated recipe, ready to serve tiles.
#[derive(Clone, Debug)]
pub struct RecipeSource {
    pub id: String,
    pub description: String,
    pub schema: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds: Bounds,
    pub fill_zoom: Option<u8>,
    pub vector_layers: Vec<VectorLayerSchema>,
    pub queries: ZoomQueries<TileQuery>,
}

impl RecipeSource {
    /// Constructs a new RecipeSource from a recipe YAML string
    pub fn from_yaml(data: &str) -> RecipeResult<RecipeSource> {
        let file: RecipeFile = serde_yaml::from_str(data)?;
        Self::try_from(file)
    }

    /// Builds the TileJSON document of this source. Tiles live under `base_url`.
    pub fn to_tilejson(&self, base_url: &str) -> TileJSON {
        let mut tilejson = tilejson! {
            tiles: vec![format!("{base_url}/{{z}}/{{x}}/{{y}}")],
            name: self.id.clone(),
            description: self.description.clone(),
        };
        tilejson.minzoom = Some(self.min_zoom);
        tilejson.maxzoom = Some(self.max_zoom);
        tilejson.bounds = Some(self.bounds);
        tilejson.fillzoom = self.fill_zoom;
        tilejson.vector_layers = Some(
            self.vector_layers
                .iter()
                .map(|layer| VectorLayer::new(layer.id.clone(), layer.fields.clone()))
                .collect(),
        );
        tilejson.other.insert(
            "schema".to_string(),
            serde_json::Value::String(self.schema.clone()),
        );
        tilejson
    }
}

impl TryFrom<RecipeFile> for RecipeSource {
    type Error = RecipeError;

    fn try_from(file: RecipeFile) -> RecipeResult<Self> {
        let name = file.name.trim().to_string();
        if name.is_empty() {
            return Err(RecipeError::malformed(&file.name, "name must not be empty"));
        }
        let malformed = |reason: String| RecipeError::malformed(&name, reason);

        if file.minzoom > file.maxzoom {
            return Err(malformed(format!(
                "minzoom {} is greater than maxzoom {}",
                file.minzoom, file.maxzoom
            )));
        }
        if file.maxzoom > MAX_ZOOM {
            return Err(malformed(format!(
                "maxzoom {} is greater than {MAX_ZOOM}",
                file.maxzoom
            )));
        }
        if let Some(fill_zoom) = file.fillzoom {
            if fill_zoom > file.maxzoom {
                return Err(malformed(format!(
                    "fillzoom {fill_zoom} is greater than maxzoom {}",
                    file.maxzoom
                )));
            }
        }
        let bounds = parse_bounds(file.bounds.as_deref()).map_err(malformed)?;

        if file.fields.is_some() {
            warn!("Recipe {name} uses the deprecated top level 'fields', ignoring it. Declare fields per layer in 'vector_layers' instead.");
        }

        let mut raw = ZoomQueries::default();
        for (key, sql) in file.sqls {
            let zoom_key: ZoomKey = key.parse().map_err(malformed)?;
            if raw.insert(zoom_key, (key.clone(), sql)).is_some() {
                return Err(malformed(format!("zoom key {zoom_key} is defined twice")));
            }
        }
        if raw.is_empty() {
            return Err(malformed("no queries defined in 'sqls'".to_string()));
        }
        let uncovered = raw.uncovered(file.minzoom, file.maxzoom);
        if !uncovered.is_empty() {
            return Err(malformed(format!(
                "no query for zoom levels {uncovered:?}, add them or a 'z*' query"
            )));
        }
        let unreachable = raw.unreachable(file.minzoom, file.maxzoom);
        if !unreachable.is_empty() {
            warn!(
                "Recipe {name} has queries for zoom levels {unreachable:?} outside of [{}, {}], they will never be used",
                file.minzoom, file.maxzoom
            );
        }
        let queries = raw.try_map(|_, (key, sql)| {
            TileQuery::compile(&sql).map_err(|e| malformed(format!("query {key}: {e}")))
        })?;

        Ok(RecipeSource {
            id: name,
            description: file.description,
            schema: file.schema,
            min_zoom: file.minzoom,
            max_zoom: file.maxzoom,
            bounds,
            fill_zoom: file.fillzoom,
            vector_layers: file.vector_layers,
            queries,
        })
    }
}

fn parse_bounds(bounds: Option<&[f64]>) -> Result<Bounds, String> {
    let [west, south, east, north] = match bounds {
        None => WEB_MERCATOR_BOUNDS,
        Some(&[w, s, e, n]) => [w, s, e, n],
        Some(other) => {
            return Err(format!(
                "bounds must be [west, south, east, north], got {} values",
                other.len()
            ))
        }
    };
    if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
        return Err(format!("longitudes in bounds must be within ±180, got {west} and {east}"));
    }
    if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
        return Err(format!("latitudes in bounds must be within ±90, got {south} and {north}"));
    }
    if west > east || south > north {
        return Err(format!("bounds [{west}, {south}, {east}, {north}] are inverted"));
    }
    Ok(Bounds::new(west, south, east, north))
}

#[async_trait]
impl TileSource for RecipeSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn zoom_range(&self) -> (u8, u8) {
        (self.min_zoom, self.max_zoom)
    }

    fn tilejson(&self, base_url: &str) -> TileJSON {
        self.to_tilejson(base_url)
    }

    async fn get_tile(
        &self,
        db: &dyn QueryExecutor,
        xyz: Xyz,
        cancel: &CancellationToken,
    ) -> TileResult<Tile> {
        let query = self
            .queries
            .resolve(&self.id, self.min_zoom, self.max_zoom, xyz.z)?;
        fetch_tile(db, query, &self.id, xyz, cancel).await
    }
}
