use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{RecipeError, RecipeResult};
use crate::recipe::RecipeSource;

const RECIPE_EXTENSIONS: [&str; 2] = ["yml", "yaml"];

/// Reads every recipe found under `dir`, recursively and in path order.
///
/// Broken recipes are logged and skipped. A missing directory simply has no recipes.
/// The result still needs to go through [`crate::registry::SourceRegistry::build`],
/// which takes care of duplicate ids.
pub fn load_recipes(dir: &Path) -> Vec<(String, RecipeSource)> {
    info!("Looking for recipes in {}", dir.display());
    if !dir.exists() {
        warn!("Recipe directory {} does not exist, no sources loaded", dir.display());
        return Vec::new();
    }

    let mut sources = Vec::new();
    for path in list_recipe_files(dir) {
        match read_recipe(&path) {
            Ok(Some(source)) => {
                info!(
                    "Found source {} in {} (zoom {}..={})",
                    source.id,
                    path.display(),
                    source.min_zoom,
                    source.max_zoom
                );
                sources.push((source.id.clone(), source));
            }
            Ok(None) => warn!("Recipe {} is empty, skipping", path.display()),
            Err(e) => warn!("Skipping recipe {}: {e}", path.display()),
        }
    }
    sources
}

fn read_recipe(path: &Path) -> RecipeResult<Option<RecipeSource>> {
    let data = fs::read_to_string(path).map_err(|e| RecipeError::Io(e, path.to_path_buf()))?;
    if data.trim().is_empty() {
        return Ok(None);
    }
    RecipeSource::from_yaml(&data).map(Some)
}

/// Unreadable directory entries are logged and skipped.
fn list_recipe_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let it = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
    for entry in it {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{}", RecipeError::Walk(e, dir.to_path_buf()));
                continue;
            }
        };
        let is_recipe = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| RECIPE_EXTENSIONS.contains(&ext));
        if entry.file_type().is_file() && is_recipe {
            files.push(entry.into_path());
        }
    }
    files
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|s| s.starts_with('.'))
}
