//! Module registry.
//!
//! Maps module names to factories. Constructed at startup, populated via
//! `register()`, and handed to the [`ModuleHost`](crate::host::ModuleHost)
//! by value.

use crate::error::{HostError, HostResult};
use crate::module::{ModuleFactory, RtModule};
use std::collections::HashMap;

/// Registry of loadable modules.
pub struct ModuleRegistry {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the built-in modules.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        crate::modules::register_builtin_modules(&mut reg);
        reg
    }

    /// Register a module factory.
    ///
    /// # Panics
    /// Panics if a module with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: ModuleFactory) {
        if self.factories.contains_key(name) {
            panic!("Module '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Get a module factory by name.
    pub fn get_factory(&self, name: &str) -> Option<ModuleFactory> {
        self.factories.get(name).copied()
    }

    /// Create a fresh module by name.
    ///
    /// # Errors
    /// Returns `HostError::ModuleNotFound` if no module with the given name is registered.
    pub fn create_module(&self, name: &str) -> HostResult<Box<dyn RtModule>> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))?;
        Ok(factory())
    }

    /// All registered module names, sorted.
    pub fn list_modules(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleContext;

    struct TestModule;

    impl RtModule for TestModule {
        fn name(&self) -> &'static str {
            "test"
        }

        fn start(&mut self, _ctx: &ModuleContext) -> HostResult<()> {
            Ok(())
        }
    }

    fn create_test_module() -> Box<dyn RtModule> {
        Box::new(TestModule)
    }

    #[test]
    fn registry_register_and_create() {
        let mut reg = ModuleRegistry::new();
        reg.register("test_module", create_test_module);

        let module = reg.create_module("test_module").expect("should create");
        assert_eq!(module.name(), "test");
        assert!(!module.exports_vtable());
    }

    #[test]
    fn registry_module_not_found() {
        let reg = ModuleRegistry::new();
        let result = reg.create_module("nonexistent");
        assert!(matches!(result, Err(HostError::ModuleNotFound(_))));
    }

    #[test]
    fn registry_lists_builtins() {
        let reg = ModuleRegistry::with_builtins();
        assert_eq!(reg.list_modules(), vec!["kins", "logic", "scale"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn registry_duplicate_panics() {
        let mut reg = ModuleRegistry::new();
        reg.register("dup", create_test_module);
        reg.register("dup", create_test_module);
    }
}
