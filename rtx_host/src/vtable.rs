//! Shared vtables exported by modules.
//!
//! A module publishes a typed table under `(name, version)`; other modules
//! take counted references to it. An exporter cannot be unloaded while its
//! tables are referenced, which is why full shutdown unloads exporters last.

use crate::error::{HostError, HostResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct VtableEntry {
    module: String,
    table: Arc<dyn Any + Send + Sync>,
    refs: u32,
}

/// Registry of exported vtables.
#[derive(Default)]
pub struct VtableRegistry {
    entries: Mutex<HashMap<(String, u32), VtableEntry>>,
}

impl VtableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `table` as `name` v`version` on behalf of `module`.
    pub fn export<T: Any + Send + Sync>(
        &self,
        module: &str,
        name: &str,
        version: u32,
        table: Arc<T>,
    ) -> HostResult<()> {
        let mut entries = self.entries.lock();
        let key = (name.to_string(), version);
        if let Some(existing) = entries.get(&key) {
            return Err(HostError::VtableExists {
                name: name.to_string(),
                version,
                module: existing.module.clone(),
            });
        }
        entries.insert(
            key,
            VtableEntry {
                module: module.to_string(),
                table,
                refs: 0,
            },
        );
        debug!("Vtable '{}' v{} exported by '{}'", name, version, module);
        Ok(())
    }

    /// Take a reference to `name` v`version` as a `T`.
    pub fn reference<T: Any + Send + Sync>(&self, name: &str, version: u32) -> HostResult<Arc<T>> {
        let mut entries = self.entries.lock();
        let not_found = || HostError::VtableNotFound {
            name: name.to_string(),
            version,
        };
        let entry = entries
            .get_mut(&(name.to_string(), version))
            .ok_or_else(not_found)?;
        let table = Arc::clone(&entry.table)
            .downcast::<T>()
            .map_err(|_| not_found())?;
        entry.refs += 1;
        Ok(table)
    }

    /// Give back a reference taken with [`VtableRegistry::reference`].
    pub fn unreference(&self, name: &str, version: u32) -> HostResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&(name.to_string(), version))
            .ok_or_else(|| HostError::VtableNotFound {
                name: name.to_string(),
                version,
            })?;
        entry.refs = entry.refs.saturating_sub(1);
        Ok(())
    }

    /// Outstanding references to `name` v`version`.
    pub fn refs(&self, name: &str, version: u32) -> Option<u32> {
        self.entries
            .lock()
            .get(&(name.to_string(), version))
            .map(|e| e.refs)
    }

    /// Fail if a vtable of `module` is still referenced.
    pub fn check_unused(&self, module: &str) -> HostResult<()> {
        let entries = self.entries.lock();
        match entries
            .iter()
            .find(|(_, e)| e.module == module && e.refs > 0)
        {
            Some(((name, version), e)) => Err(HostError::VtableInUse {
                name: name.clone(),
                version: *version,
                refs: e.refs,
            }),
            None => Ok(()),
        }
    }

    /// Withdraw every vtable of `module`.
    pub fn remove_module(&self, module: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.module != module);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Table {
        factor: f64,
    }

    #[test]
    fn export_reference_release() {
        let reg = VtableRegistry::new();
        reg.export("kins", "trivkins", 1, Arc::new(Table { factor: 2.0 }))
            .unwrap();
        assert!(matches!(
            reg.export("other", "trivkins", 1, Arc::new(Table { factor: 1.0 })),
            Err(HostError::VtableExists { .. })
        ));

        let t = reg.reference::<Table>("trivkins", 1).unwrap();
        assert_eq!(t.factor, 2.0);
        assert_eq!(reg.refs("trivkins", 1), Some(1));
        assert!(matches!(
            reg.check_unused("kins"),
            Err(HostError::VtableInUse { refs: 1, .. })
        ));

        reg.unreference("trivkins", 1).unwrap();
        assert!(reg.check_unused("kins").is_ok());
        assert_eq!(reg.remove_module("kins"), 1);
        assert!(reg.refs("trivkins", 1).is_none());
    }

    #[test]
    fn wrong_version_or_type_is_not_found() {
        let reg = VtableRegistry::new();
        reg.export("kins", "trivkins", 1, Arc::new(Table { factor: 1.0 }))
            .unwrap();
        assert!(reg.reference::<Table>("trivkins", 2).is_err());
        assert!(reg.reference::<String>("trivkins", 1).is_err());
        assert_eq!(reg.refs("trivkins", 1), Some(0));
    }
}
