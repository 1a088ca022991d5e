//! Zoom keys and per-zoom query resolution.
//!
//! Recipes map zoom keys to SQL templates. A key is either exact (`z7`, only zoom 7) or the
//! wildcard `z*` (any zoom). When both could answer, the exact key wins, which lets a recipe
//! override a handful of zoom levels while defaulting everywhere else.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::{TileError, TileResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoomKey {
    Exact(u8),
    Wildcard,
}

impl FromStr for ZoomKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('z')
            .ok_or_else(|| format!("zoom key {s:?} must start with 'z'"))?;
        if rest == "*" {
            return Ok(Self::Wildcard);
        }
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("zoom key {s:?} must be z<zoom> or z*"));
        }
        rest.parse()
            .map(Self::Exact)
            .map_err(|_| format!("zoom in key {s:?} is too large"))
    }
}

impl Display for ZoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(z) => write!(f, "z{z}"),
            Self::Wildcard => f.write_str("z*"),
        }
    }
}

/// Values (typically compiled SQL templates) keyed by zoom, plus an optional wildcard.
#[derive(Clone, Debug, PartialEq)]
pub struct ZoomQueries<Q> {
    exact: BTreeMap<u8, Q>,
    wildcard: Option<Q>,
}

impl<Q> Default for ZoomQueries<Q> {
    fn default() -> Self {
        Self {
            exact: BTreeMap::new(),
            wildcard: None,
        }
    }
}

impl<Q> ZoomQueries<Q> {
    /// Stores `query` under `key`, handing back the value it replaced, if any.
    pub fn insert(&mut self, key: ZoomKey, query: Q) -> Option<Q> {
        match key {
            ZoomKey::Exact(z) => self.exact.insert(z, query),
            ZoomKey::Wildcard => self.wildcard.replace(query),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_none()
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    /// Query for zoom `z`, ignoring any zoom range. Exact keys take precedence.
    pub fn get(&self, z: u8) -> Option<&Q> {
        self.exact.get(&z).or(self.wildcard.as_ref())
    }

    /// Zoom levels in `[min_zoom, max_zoom]` that no key covers.
    pub fn uncovered(&self, min_zoom: u8, max_zoom: u8) -> Vec<u8> {
        if self.has_wildcard() {
            return Vec::new();
        }
        (min_zoom..=max_zoom)
            .filter(|z| !self.exact.contains_key(z))
            .collect()
    }

    /// Exact keys that can never be used because they fall outside `[min_zoom, max_zoom]`.
    pub fn unreachable(&self, min_zoom: u8, max_zoom: u8) -> Vec<u8> {
        self.exact
            .keys()
            .copied()
            .filter(|z| !(min_zoom..=max_zoom).contains(z))
            .collect()
    }

    /// Resolves the query to run for zoom `z` of source `source_id`.
    pub fn resolve(&self, source_id: &str, min_zoom: u8, max_zoom: u8, z: u8) -> TileResult<&Q> {
        if z < min_zoom || z > max_zoom {
            return Err(TileError::ZoomOutOfRange {
                source_id: source_id.to_string(),
                zoom: z,
                min_zoom,
                max_zoom,
            });
        }
        self.get(z).ok_or_else(|| TileError::NoQueryForZoom {
            source_id: source_id.to_string(),
            zoom: z,
        })
    }

    /// Converts every stored value, failing on the first error.
    pub fn try_map<R, E>(
        self,
        mut f: impl FnMut(ZoomKey, Q) -> Result<R, E>,
    ) -> Result<ZoomQueries<R>, E> {
        let mut result = ZoomQueries::default();
        for (z, q) in self.exact {
            result.exact.insert(z, f(ZoomKey::Exact(z), q)?);
        }
        if let Some(q) = self.wildcard {
            result.wildcard = Some(f(ZoomKey::Wildcard, q)?);
        }
        Ok(result)
    }
}
