use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cosmos::CosmosPlugin;
use crate::stable::StablePlugin;
use crate::{NetworkPlugin, PluginError, PluginInfo};

/// Maps plugin names to capability bundles.
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn NetworkPlugin>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self { plugins: BTreeMap::new() }
    }

    pub fn register(&mut self, plugin: Arc<dyn NetworkPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn NetworkPlugin>, PluginError> {
        self.plugins.get(name).cloned().ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }

    /// Metadata for every registered plugin, in name order.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(|p| p.info()).collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(StablePlugin));
        registry.register(Arc::new(CosmosPlugin));
        registry
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.plugins.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtin_bundles() {
        let registry = PluginRegistry::default();
        assert!(registry.get("stable").is_ok());
        assert!(registry.get("cosmos").is_ok());
        assert!(registry.get("nope").is_err());
    }

    #[test]
    fn list_is_name_ordered() {
        let registry = PluginRegistry::default();
        let names: Vec<_> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["cosmos", "stable"]);
    }
}
