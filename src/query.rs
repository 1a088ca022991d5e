//! SQL templates with named tile parameters, and running them.
//!
//! Recipe authors write `:z`, `:x` and `:y` wherever the tile address is needed. Templates
//! are compiled once into positional Postgres parameters (`$1`, `$2`, ...) and the tile
//! address is always bound, never spliced into the SQL text.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::{DbError, TileError, TileResult};
use crate::{Tile, Xyz};

/// One of the values a template can ask for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileParam {
    Z,
    X,
    Y,
}

impl TileParam {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "z" => Some(Self::Z),
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            _ => None,
        }
    }

    /// Value bound for this parameter. Postgres has no unsigned integers, and zoom 30 keeps
    /// x and y well inside `i32`.
    pub fn value(self, xyz: Xyz) -> i32 {
        let v = match self {
            Self::Z => u32::from(xyz.z),
            Self::X => xyz.x,
            Self::Y => xyz.y,
        };
        v as i32
    }
}

/// A compiled SQL template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileQuery {
    sql: String,
    params: Vec<TileParam>,
}

impl TileQuery {
    /// Rewrites `:name` placeholders into `$n`. Each distinct name gets a single index, in order
    /// of first appearance. String literals, quoted identifiers, comments, `::` casts and `:=`
    /// are left alone. Any name other than `z`, `x` or `y` is rejected.
    pub fn compile(template: &str) -> Result<Self, String> {
        let chars: Vec<char> = template.chars().collect();
        let mut sql = String::with_capacity(template.len());
        let mut params: Vec<TileParam> = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' => {
                    let end = find_closing(&chars, i + 1, c)
                        .ok_or_else(|| format!("unterminated {c} quote in query"))?;
                    sql.extend(&chars[i..=end]);
                    i = end + 1;
                }
                '-' if chars.get(i + 1) == Some(&'-') => {
                    let end = chars[i..]
                        .iter()
                        .position(|&c| c == '\n')
                        .map_or(chars.len(), |p| i + p);
                    sql.extend(&chars[i..end]);
                    i = end;
                }
                '/' if chars.get(i + 1) == Some(&'*') => {
                    let end = chars[i + 2..]
                        .windows(2)
                        .position(|w| w == ['*', '/'])
                        .map(|p| i + 2 + p + 2)
                        .ok_or("unterminated block comment in query")?;
                    sql.extend(&chars[i..end]);
                    i = end;
                }
                ':' if matches!(chars.get(i + 1), Some(':' | '=')) => {
                    sql.extend(&chars[i..i + 2]);
                    i += 2;
                }
                ':' if chars
                    .get(i + 1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') =>
                {
                    let start = i + 1;
                    let end = chars[start..]
                        .iter()
                        .position(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
                        .map_or(chars.len(), |p| start + p);
                    let name: String = chars[start..end].iter().collect();
                    let param = TileParam::from_name(&name)
                        .ok_or_else(|| format!("unknown query parameter :{name}"))?;
                    let index = match params.iter().position(|p| *p == param) {
                        Some(idx) => idx + 1,
                        None => {
                            params.push(param);
                            params.len()
                        }
                    };
                    sql.push('$');
                    sql.push_str(&index.to_string());
                    i = end;
                }
                c => {
                    sql.push(c);
                    i += 1;
                }
            }
        }

        Ok(Self { sql, params })
    }

    /// Postgres flavored SQL with positional parameters.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameters in positional order, `params()[0]` is bound to `$1`.
    pub fn params(&self) -> &[TileParam] {
        &self.params
    }

    /// Values to bind for a given tile, in positional order.
    pub fn bindings(&self, xyz: Xyz) -> Vec<i32> {
        self.params.iter().map(|p| p.value(xyz)).collect()
    }
}

/// Index of the closing `quote`, honoring doubled quotes as escapes.
fn find_closing(chars: &[char], mut i: usize, quote: char) -> Option<usize> {
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Anything able to run a [`TileQuery`]. Each returned row carries a single binary column.
///
/// The connection pool behind an executor is owned elsewhere; implementations must report
/// an exhausted pool as [`DbError::PoolExhausted`] rather than as a query failure.
pub trait QueryExecutor: Send + Sync {
    fn fetch_rows<'a>(&'a self, query: &'a TileQuery, xyz: Xyz)
        -> BoxStream<'a, Result<Tile, DbError>>;
}

/// Runs `query` for `xyz` and extracts the tile payload.
///
/// No row means no features and yields an empty tile. More than one row means the recipe is
/// broken. The query is abandoned as soon as `cancel` fires.
pub async fn fetch_tile(
    db: &dyn QueryExecutor,
    query: &TileQuery,
    source_id: &str,
    xyz: Xyz,
    cancel: &CancellationToken,
) -> TileResult<Tile> {
    let read = async {
        let mut rows = db.fetch_rows(query, xyz);
        let Some(tile) = rows.try_next().await? else {
            debug!("No rows for tile {xyz} of {source_id}, returning an empty tile");
            return Ok(Ok(Tile::new()));
        };
        if rows.try_next().await?.is_some() {
            return Ok(Err(TileError::AmbiguousTileResult {
                source_id: source_id.to_string(),
                xyz,
            }));
        }
        Ok::<_, DbError>(Ok(tile))
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TileError::Cancelled {
            source_id: source_id.to_string(),
            xyz,
        }),
        res = read => res.map_err(|e| TileError::from_db(e, source_id, xyz))?,
    }
}
