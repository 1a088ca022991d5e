use std::collections::HashMap;

use log::warn;

use crate::error::{DuplicateSourceId, TileError, TileResult};
use crate::TileSource;

/// All tile sources known to the server, keyed by id.
///
/// The registry is assembled once at startup and never changes afterwards, so it can be
/// shared between request handlers without any locking.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Box<dyn TileSource>>,
}

impl SourceRegistry {
    /// Builds the registry from loader output. The first source registered under an id
    /// wins; every later one is dropped and reported.
    pub fn build<S, I>(sources: I) -> (Self, Vec<DuplicateSourceId>)
    where
        S: TileSource + 'static,
        I: IntoIterator<Item = (String, S)>,
    {
        Self::build_boxed(
            sources
                .into_iter()
                .map(|(id, source)| (id, Box::new(source) as Box<dyn TileSource>)),
        )
    }

    /// Same as [`SourceRegistry::build`], for mixed kinds of sources.
    pub fn build_boxed<I>(sources: I) -> (Self, Vec<DuplicateSourceId>)
    where
        I: IntoIterator<Item = (String, Box<dyn TileSource>)>,
    {
        let mut registry = Self::default();
        let mut duplicates = Vec::new();
        for (id, source) in sources {
            if registry.sources.contains_key(&id) {
                let dup = DuplicateSourceId(id);
                warn!("{dup}");
                duplicates.push(dup);
                continue;
            }
            registry.sources.insert(id, source);
        }
        (registry, duplicates)
    }

    pub fn get(&self, id: &str) -> Option<&dyn TileSource> {
        self.sources.get(id).map(|source| source.as_ref())
    }

    /// Like [`SourceRegistry::get`], but a missing source is an error.
    pub fn get_source(&self, id: &str) -> TileResult<&dyn TileSource> {
        self.get(id)
            .ok_or_else(|| TileError::SourceNotFound(id.to_string()))
    }

    /// Every registered id, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::RecipeSource;

    fn source(name: &str, description: &str) -> (String, RecipeSource) {
        let data = format!(
            "name: {name}\ndescription: {description}\nminzoom: 0\nmaxzoom: 14\nsqls:\n  z*: SELECT 1\n"
        );
        (name.to_string(), RecipeSource::from_yaml(&data).unwrap())
    }

    fn description(registry: &SourceRegistry, id: &str) -> String {
        registry
            .get(id)
            .unwrap()
            .tilejson("http://localhost")
            .description
            .unwrap()
    }

    #[test]
    fn test_first_write_wins() {
        let (registry, duplicates) =
            SourceRegistry::build(vec![source("roads", "first"), source("roads", "second")]);

        assert_eq!(1, registry.len());
        assert_eq!(vec![DuplicateSourceId("roads".to_string())], duplicates);
        assert_eq!("first", description(&registry, "roads"));
    }

    #[test]
    fn test_order_does_not_matter() {
        let forward = vec![source("roads", "r"), source("water", "w"), source("poi", "p")];
        let mut backward = forward.clone();
        backward.reverse();

        let (a, dup_a) = SourceRegistry::build(forward);
        let (b, dup_b) = SourceRegistry::build(backward);
        assert!(dup_a.is_empty() && dup_b.is_empty());
        assert_eq!(vec!["poi", "roads", "water"], a.list_ids());
        assert_eq!(a.list_ids(), b.list_ids());
        for id in a.list_ids() {
            assert_eq!(description(&a, &id), description(&b, &id));
        }
    }

    #[test]
    fn test_missing_source() {
        let (registry, _) = SourceRegistry::build(vec![source("roads", "r")]);
        assert!(registry.get("water").is_none());
        assert!(matches!(
            registry.get_source("water"),
            Err(TileError::SourceNotFound(id)) if id == "water"
        ));
        assert_eq!("roads", registry.get_source("roads").unwrap().id());
    }

    #[test]
    fn test_empty_registry() {
        let (registry, duplicates) = SourceRegistry::build(Vec::<(String, RecipeSource)>::new());
        assert!(registry.is_empty());
        assert!(duplicates.is_empty());
        assert!(registry.list_ids().is_empty());
    }
}
