//! cache.rs — déduplication de `require` et d'extensions chargées (C5, §4.5).
//!
//! Un seul `Runtime` par VM, partagé par toutes les tâches qu'elle lance
//! (Open Question §9 #3) : `require`-er le même module depuis deux tâches
//! concurrentes ne le recharge/recompile qu'une fois.

use parking_lot::RwLock;

use lattice_core::value::ExtensionId;

#[derive(Default)]
pub struct ModuleCache {
    required: RwLock<ahash::AHashMap<String, lattice_core::value::Value>>,
    extensions: RwLock<ahash::AHashMap<String, ExtensionId>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Résultat déjà en cache pour `path`, s'il a déjà été `require`-é.
    pub fn get_required(&self, path: &str) -> Option<lattice_core::value::Value> {
        self.required.read().get(path).map(lattice_core::value::Value::deep_clone)
    }

    /// Enregistre le résultat d'un premier `require` de `path`.
    pub fn put_required(&self, path: &str, exports: lattice_core::value::Value) {
        self.required.write().insert(path.to_string(), exports);
    }

    pub fn is_required(&self, path: &str) -> bool {
        self.required.read().contains_key(path)
    }

    /// Liste des chemins déjà `require`-és (diagnostics/tests).
    pub fn required_files(&self) -> Vec<String> {
        self.required.read().keys().cloned().collect()
    }

    pub fn get_extension(&self, path: &str) -> Option<ExtensionId> {
        self.extensions.read().get(path).copied()
    }

    pub fn put_extension(&self, path: &str, id: ExtensionId) {
        self.extensions.write().insert(path.to_string(), id);
    }

    pub fn loaded_extensions(&self) -> Vec<String> {
        self.extensions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::value::Value;

    #[test]
    fn require_is_deduped() {
        let cache = ModuleCache::new();
        assert!(!cache.is_required("a.lat"));
        cache.put_required("a.lat", Value::Int(1));
        assert!(cache.is_required("a.lat"));
        assert_eq!(cache.get_required("a.lat"), Some(Value::Int(1)));
    }

    #[test]
    fn extensions_track_separately_from_modules() {
        let cache = ModuleCache::new();
        cache.put_extension("libfoo.so", ExtensionId(1));
        assert_eq!(cache.get_extension("libfoo.so"), Some(ExtensionId(1)));
        assert!(cache.get_required("libfoo.so").is_none());
    }
}
