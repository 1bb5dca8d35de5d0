//! Loadable module interface.
//!
//! A module is resolved by name through the [`ModuleRegistry`](crate::registry::ModuleRegistry),
//! receives its `key=value` load arguments through [`RtModule::set_param`],
//! and exports pins, params, functions and vtables from
//! [`RtModule::start`] via a [`ModuleContext`].
//!
//! # Lifecycle
//!
//! 1. `set_param()` - once per load argument, before anything is created
//! 2. `start()` - the component exists; export objects here
//! 3. `new_instance()` / `delete_instance()` - instantiable modules only
//! 4. `stop()` - before the component and its objects are deleted

use crate::error::{HostError, HostResult};
use crate::functions::FunctionTable;
use crate::vtable::VtableRegistry;
use rtx_common::flavor::TaskCycle;
use rtx_hal::{HalStore, HalType, HalValue, ObjectRef, ObjectType, ParamDir, ParamRef, PinDir, PinRef};
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Factory function type for creating module instances.
pub type ModuleFactory = fn() -> Box<dyn RtModule>;

/// Interface of a loadable realtime module.
pub trait RtModule: Send {
    /// Registry name, also the component name.
    fn name(&self) -> &'static str;

    /// Apply one load argument.
    ///
    /// Default: every parameter is unknown.
    fn set_param(&mut self, key: &str, _value: &str) -> HostResult<()> {
        Err(HostError::param(self.name(), key, "unknown parameter"))
    }

    /// Export the module's objects. An error unloads the module again.
    fn start(&mut self, ctx: &ModuleContext) -> HostResult<()>;

    /// Release resources. The component is deleted afterwards.
    fn stop(&mut self, _ctx: &ModuleContext) -> HostResult<()> {
        Ok(())
    }

    /// Whether this module exports vtables other modules may reference.
    fn exports_vtable(&self) -> bool {
        false
    }

    /// Create the objects of a new instance.
    ///
    /// Default: the module is not instantiable.
    fn new_instance(&mut self, ctx: &ModuleContext, _args: &[(String, String)]) -> HostResult<()> {
        Err(HostError::NotInstantiable(ctx.module().to_string()))
    }

    /// Forget an instance. Its objects are deleted afterwards.
    fn delete_instance(&mut self, _ctx: &ModuleContext) -> HostResult<()> {
        Ok(())
    }
}

/// Parse the value of a `key=value` argument.
pub fn parse_arg<T: FromStr>(module: &str, key: &str, value: &str) -> HostResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| HostError::param(module, key, e.to_string()))
}

/// What a module sees of the host while exporting objects.
///
/// Objects are owned by the component of the module, or by one of its
/// instances; names are prefixed with the owner's name.
pub struct ModuleContext {
    store: Arc<HalStore>,
    functions: Arc<FunctionTable>,
    vtables: Arc<VtableRegistry>,
    module: String,
    owner: ObjectRef,
    owner_name: String,
}

impl ModuleContext {
    pub(crate) fn new(
        store: Arc<HalStore>,
        functions: Arc<FunctionTable>,
        vtables: Arc<VtableRegistry>,
        module: &str,
        owner: ObjectRef,
        owner_name: &str,
    ) -> Self {
        Self {
            store,
            functions,
            vtables,
            module: module.to_string(),
            owner,
            owner_name: owner_name.to_string(),
        }
    }

    /// Module name.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Owner name: the component, or the instance being created.
    pub fn name(&self) -> &str {
        &self.owner_name
    }

    /// Whether the owner is an instance.
    pub fn is_instance(&self) -> bool {
        self.owner.object_type == ObjectType::Instance
    }

    /// The object store.
    pub fn store(&self) -> &Arc<HalStore> {
        &self.store
    }

    fn full_name(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.owner_name.clone()
        } else {
            format!("{}.{}", self.owner_name, suffix)
        }
    }

    /// Create pin `<owner>.<suffix>` and return a lock-free handle to it.
    pub fn pin(&self, suffix: &str, hal_type: HalType, dir: PinDir) -> HostResult<PinRef> {
        let name = self.full_name(suffix);
        self.store
            .lock()?
            .pin_new(self.owner, &name, hal_type, dir, 0)?;
        Ok(self.store.pin_ref(&name)?)
    }

    /// Create parameter `<owner>.<suffix>` holding `init`.
    pub fn param(&self, suffix: &str, dir: ParamDir, init: HalValue) -> HostResult<ParamRef> {
        let name = self.full_name(suffix);
        self.store
            .lock()?
            .param_new(self.owner, &name, init.hal_type(), dir, Some(init))?;
        Ok(self.store.param_ref(&name)?)
    }

    /// Export function `<owner>.<suffix>` running `body` once per thread cycle.
    ///
    /// Returns the function name.
    pub fn export_funct<F>(
        &self,
        suffix: &str,
        uses_fp: bool,
        reentrant: bool,
        body: F,
    ) -> HostResult<String>
    where
        F: FnMut(&TaskCycle) + Send + 'static,
    {
        let name = self.full_name(suffix);
        let handle = self
            .functions
            .insert(&self.module, &self.owner_name, &name, Box::new(body));
        let res = self
            .store
            .lock()
            .and_then(|mut g| g.funct_new(self.owner, &name, uses_fp, reentrant, handle));
        if let Err(e) = res {
            self.functions.remove(handle);
            return Err(e.into());
        }
        debug!("Function '{}' exported by '{}'", name, self.module);
        Ok(name)
    }

    /// Publish a vtable owned by this module.
    pub fn export_vtable<T: Any + Send + Sync>(
        &self,
        name: &str,
        version: u32,
        table: Arc<T>,
    ) -> HostResult<()> {
        self.vtables.export(&self.module, name, version, table)
    }

    /// Take a counted reference to a vtable of another module.
    pub fn reference_vtable<T: Any + Send + Sync>(
        &self,
        name: &str,
        version: u32,
    ) -> HostResult<Arc<T>> {
        self.vtables.reference(name, version)
    }

    /// Release a reference taken with [`ModuleContext::reference_vtable`].
    pub fn unreference_vtable(&self, name: &str, version: u32) -> HostResult<()> {
        self.vtables.unreference(name, version)
    }
}
