//! The module host.
//!
//! [`ModuleHost`] keeps the load-order list of realtime modules, the
//! function table their threads run, the vtable registry and the flavor
//! tasks of the object store threads. It executes module commands itself
//! and hands everything else to a [`HalExecutor`].

use crate::error::{HostError, HostResult};
use crate::functions::FunctionTable;
use crate::module::{ModuleContext, RtModule};
use crate::registry::ModuleRegistry;
use crate::threads::ThreadManager;
use crate::vtable::VtableRegistry;
use rtx_common::flavor::Flavor;
use rtx_hal::{
    Command, CommandResult, CommandTarget, CompKind, HalError, HalExecutor, HalStore, ObjectFilter,
    ObjectRef, ObjectType, ThreadSpec,
};
use rtx_shared_memory::Session;
use rtx_shared_memory::platform::get_current_pid;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct LoadedModule {
    name: String,
    module: Box<dyn RtModule>,
    instances: Vec<String>,
}

/// Loads, instantiates and unloads realtime modules.
pub struct ModuleHost {
    store: Arc<HalStore>,
    session: Option<Arc<Session>>,
    registry: ModuleRegistry,
    functions: Arc<FunctionTable>,
    vtables: Arc<VtableRegistry>,
    threads: ThreadManager,
    executor: HalExecutor,
    loaded: Vec<LoadedModule>,
    pid: u32,
}

fn args_text(args: &[(String, String)]) -> String {
    args.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn ignore_missing(res: Result<(), HalError>) -> HostResult<()> {
    match res {
        Ok(()) | Err(HalError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Turn a host result into a command reply.
pub fn reply(res: HostResult<Vec<String>>) -> CommandResult {
    match res {
        Ok(notes) => CommandResult::ok(notes),
        Err(e) => CommandResult {
            code: e.code(),
            notes: vec![e.to_string()],
        },
    }
}

impl ModuleHost {
    /// Host over `store`. Threads run on `flavor`; `session` enables `log`.
    pub fn new(
        store: Arc<HalStore>,
        session: Option<Arc<Session>>,
        flavor: Flavor,
        registry: ModuleRegistry,
    ) -> Self {
        let functions = Arc::new(FunctionTable::new());
        Self {
            threads: ThreadManager::new(flavor, Arc::clone(&store), Arc::clone(&functions)),
            executor: HalExecutor::new(Arc::clone(&store), session.clone()),
            store,
            session,
            registry,
            functions,
            vtables: Arc::new(VtableRegistry::new()),
            loaded: Vec::new(),
            pid: get_current_pid(),
        }
    }

    /// The object store.
    pub fn store(&self) -> &Arc<HalStore> {
        &self.store
    }

    /// Function bodies of the loaded modules.
    pub fn functions(&self) -> &Arc<FunctionTable> {
        &self.functions
    }

    /// Exported vtables.
    pub fn vtables(&self) -> &Arc<VtableRegistry> {
        &self.vtables
    }

    /// Flavor tasks of the object store threads.
    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    /// Loaded module names in load order.
    pub fn loaded(&self) -> Vec<&str> {
        self.loaded.iter().map(|m| m.name.as_str()).collect()
    }

    /// Instances of `module` in creation order.
    pub fn instances_of(&self, module: &str) -> Vec<&str> {
        self.position(module)
            .map(|i| self.loaded[i].instances.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn position(&self, module: &str) -> Option<usize> {
        self.loaded.iter().position(|m| m.name == module)
    }

    fn context(&self, module: &str, owner: ObjectRef, owner_name: &str) -> ModuleContext {
        ModuleContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.functions),
            Arc::clone(&self.vtables),
            module,
            owner,
            owner_name,
        )
    }

    /// Load `name` with `key=value` arguments and start it.
    ///
    /// Argument errors leave nothing behind. A failing start deletes every
    /// object the module created before the error is returned.
    pub fn load(&mut self, name: &str, args: &[(String, String)]) -> HostResult<()> {
        if self.position(name).is_some() {
            return Err(HostError::AlreadyLoaded(name.to_string()));
        }
        let mut module = self.registry.create_module(name)?;
        for (key, value) in args {
            module.set_param(key, value)?;
        }

        let owner = {
            let mut g = self.store.lock()?;
            let owner = g.comp_new(name, CompKind::Realtime, self.pid)?;
            if let Err(e) = g.comp_set_args(name, &args_text(args)) {
                g.comp_delete(name)?;
                return Err(e.into());
            }
            owner
        };

        let ctx = self.context(name, owner, name);
        let started = module.start(&ctx).and_then(|()| {
            self.store.lock()?.comp_ready(name)?;
            Ok(())
        });
        if let Err(e) = started {
            warn!("Module '{}' failed to start: {}", name, e);
            if let Err(cleanup) = self.discard(name) {
                error!("Cleanup after '{}' failed: {}", name, cleanup);
            }
            return Err(e);
        }

        self.loaded.push(LoadedModule {
            name: name.to_string(),
            module,
            instances: Vec::new(),
        });
        info!("Module '{}' loaded", name);
        Ok(())
    }

    // Objects, bodies and vtables of `module`.
    fn discard(&mut self, module: &str) -> HostResult<()> {
        self.functions.remove_module(module);
        let res = ignore_missing(self.store.lock()?.comp_delete(module));
        self.vtables.remove_module(module);
        res
    }

    /// Unload `name`, or every module when `name` is `all`.
    pub fn unload(&mut self, name: &str) -> HostResult<()> {
        if name == "all" {
            return self.unload_all();
        }
        let pos = self
            .position(name)
            .ok_or_else(|| HostError::NotLoaded(name.to_string()))?;
        self.vtables.check_unused(name)?;
        let entry = self.loaded.remove(pos);
        self.teardown(entry)
    }

    /// Unload everything in reverse load order.
    ///
    /// Vtable exporters are deferred to a final pass. Errors are logged and
    /// the first one is returned after every module is gone.
    pub fn unload_all(&mut self) -> HostResult<()> {
        let mut first_err = None;
        for exporters in [false, true] {
            let mut i = self.loaded.len();
            while i > 0 {
                i -= 1;
                if self.loaded[i].module.exports_vtable() != exporters {
                    continue;
                }
                let entry = self.loaded.remove(i);
                let name = entry.name.clone();
                if let Err(e) = self.teardown(entry) {
                    error!("Unloading '{}': {}", name, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn teardown(&mut self, mut entry: LoadedModule) -> HostResult<()> {
        let mut first_err = None;
        while let Some(inst) = entry.instances.pop() {
            let owner = self.store.lock()?.find(ObjectType::Instance, &inst);
            if let Some(owner) = owner {
                let ctx = self.context(&entry.name, owner, &inst);
                if let Err(e) = entry.module.delete_instance(&ctx) {
                    first_err.get_or_insert(e);
                }
            }
            if let Err(e) = self.purge_instance(&inst) {
                first_err.get_or_insert(e);
            }
        }

        let owner = self.store.lock()?.find(ObjectType::Component, &entry.name);
        if let Some(owner) = owner {
            let ctx = self.context(&entry.name, owner, &entry.name);
            if let Err(e) = entry.module.stop(&ctx) {
                warn!("Module '{}' stop: {}", entry.name, e);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.discard(&entry.name) {
            first_err.get_or_insert(e);
        }
        info!("Module '{}' unloaded", entry.name);
        first_err.map_or(Ok(()), Err)
    }

    fn purge_instance(&self, inst: &str) -> HostResult<()> {
        self.functions.remove_owner(inst);
        ignore_missing(self.store.lock()?.inst_delete(inst))
    }

    /// Create instance `inst` of loaded module `module`.
    pub fn new_instance(
        &mut self,
        module: &str,
        inst: &str,
        args: &[(String, String)],
    ) -> HostResult<()> {
        let pos = self
            .position(module)
            .ok_or_else(|| HostError::NotLoaded(module.to_string()))?;
        let owner = self.store.lock()?.inst_new(module, inst, &args_text(args))?;
        let ctx = self.context(module, owner, inst);
        if let Err(e) = self.loaded[pos].module.new_instance(&ctx, args) {
            if let Err(cleanup) = self.purge_instance(inst) {
                error!("Cleanup after instance '{}' failed: {}", inst, cleanup);
            }
            return Err(e);
        }
        self.loaded[pos].instances.push(inst.to_string());
        info!("Instance '{}' of '{}' created", inst, module);
        Ok(())
    }

    /// Delete instance `inst` with its objects.
    pub fn delete_instance(&mut self, inst: &str) -> HostResult<()> {
        let pos = self
            .loaded
            .iter()
            .position(|m| m.instances.iter().any(|i| i == inst))
            .ok_or_else(|| HostError::InstanceNotFound(inst.to_string()))?;
        let owner = self.store.lock()?.lookup(ObjectType::Instance, inst)?;
        let module = self.loaded[pos].name.clone();
        let ctx = self.context(&module, owner, inst);
        let res = self.loaded[pos].module.delete_instance(&ctx);
        self.loaded[pos].instances.retain(|i| i != inst);
        self.purge_instance(inst)?;
        info!("Instance '{}' of '{}' deleted", inst, module);
        res
    }

    /// Create store thread `name` and start its task.
    pub fn new_thread(&mut self, name: &str, spec: &ThreadSpec) -> HostResult<()> {
        self.store.lock()?.thread_new(name, spec)?;
        if let Err(e) = self.threads.spawn(name) {
            self.store.lock()?.thread_delete(name)?;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the task of `name` and delete the store thread.
    pub fn delete_thread(&mut self, name: &str) -> HostResult<()> {
        self.threads.stop(name)?;
        self.store.lock()?.thread_delete(name)?;
        Ok(())
    }

    /// Stop threads, unload every module, delete the threads and clear the
    /// host pid of the session.
    pub fn shutdown(&mut self) -> HostResult<()> {
        info!("Module host shutting down");
        self.store.set_threads_running(false);
        self.threads.stop_all();
        let res = self.unload_all();
        {
            let mut g = self.store.lock()?;
            for thread in g.names(&ObjectFilter::of_type(ObjectType::Thread)) {
                if let Err(e) = g.thread_delete(&thread) {
                    warn!("Thread '{}': {}", thread, e);
                }
            }
        }
        if let Some(session) = &self.session {
            session.set_host_pid(0);
        }
        res
    }
}

impl CommandTarget for ModuleHost {
    fn execute(&mut self, cmd: &Command) -> CommandResult {
        let res = match cmd {
            Command::LoadRt { module, args } => self.load(module, args),
            Command::UnloadRt { module } => self.unload(module),
            Command::NewInst { module, inst, args } => self.new_instance(module, inst, args),
            Command::DelInst { inst } => self.delete_instance(inst),
            Command::NewThread { name, spec } => self.new_thread(name, spec),
            Command::DelThread { name } => self.delete_thread(name),
            _ => return self.executor.execute(cmd),
        };
        if let Err(e) = &res {
            debug!("'{}' failed: {}", cmd, e);
        }
        reply(res.map(|()| Vec::new()))
    }
}
