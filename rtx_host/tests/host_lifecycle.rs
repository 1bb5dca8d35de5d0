//! Loading, instantiating and unloading modules through the host.

use rtx_common::flavor::Flavor;
use rtx_hal::{CommandTarget, HalStore, HalValue, ObjectFilter, ObjectType, ParamDir, run_script};
use rtx_host::modules::kins::{KINS_VERSION, KINS_VTABLE, TrivKins};
use rtx_host::{HostError, HostResult, ModuleContext, ModuleHost, ModuleRegistry, RtModule};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct Follower;

impl RtModule for Follower {
    fn name(&self) -> &'static str {
        "follower"
    }

    fn start(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        let kins: Arc<TrivKins> = ctx.reference_vtable(KINS_VTABLE, KINS_VERSION)?;
        ctx.param("joints", ParamDir::Ro, HalValue::U32(kins.joints() as u32))?;
        Ok(())
    }

    fn stop(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        ctx.unreference_vtable(KINS_VTABLE, KINS_VERSION)
    }
}

fn create_follower() -> Box<dyn RtModule> {
    Box::new(Follower)
}

static KINS_SEEN_AT_STOP: AtomicBool = AtomicBool::new(false);

struct Recorder;

impl RtModule for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn start(&mut self, _ctx: &ModuleContext) -> HostResult<()> {
        Ok(())
    }

    fn stop(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        if ctx
            .reference_vtable::<TrivKins>(KINS_VTABLE, KINS_VERSION)
            .is_ok()
        {
            KINS_SEEN_AT_STOP.store(true, Ordering::SeqCst);
            ctx.unreference_vtable(KINS_VTABLE, KINS_VERSION)?;
        }
        Ok(())
    }
}

fn create_recorder() -> Box<dyn RtModule> {
    Box::new(Recorder)
}

fn host() -> ModuleHost {
    let store = Arc::new(HalStore::in_memory(512 * 1024, 512).unwrap());
    let mut registry = ModuleRegistry::with_builtins();
    registry.register("follower", create_follower);
    registry.register("recorder", create_recorder);
    ModuleHost::new(store, None, Flavor::Posix, registry)
}

fn object_count(host: &ModuleHost) -> usize {
    host.store().lock().unwrap().count(&ObjectFilter::default())
}

#[test]
fn load_order_is_kept() {
    let mut host = host();
    run_script(&mut host, "loadrt kins\nloadrt logic count=3\nloadrt scale").unwrap();
    assert_eq!(host.loaded(), vec!["kins", "logic", "scale"]);

    let g = host.store().lock().unwrap();
    assert_eq!(g.comp_args("logic").unwrap(), "count=3");
    assert_eq!(g.param_get("logic.count").unwrap(), HalValue::U32(3));
    assert_eq!(g.param_get("kins.joints").unwrap(), HalValue::U32(3));
    assert!(g.find(ObjectType::Pin, "logic.in-02").is_some());
}

#[test]
fn bad_arguments_leave_no_trace() {
    let mut host = host();
    let before = object_count(&host);

    let res = host.execute_line("loadrt logic count=99");
    assert_eq!(res.code, -libc::EINVAL);
    let res = host.execute_line("loadrt logic colour=red");
    assert_eq!(res.code, -libc::EINVAL);

    assert!(host.loaded().is_empty());
    assert_eq!(object_count(&host), before);
}

#[test]
fn failed_start_is_rolled_back() {
    let mut host = host();
    let before = object_count(&host);

    let res = host.execute_line("loadrt kins coordinates=xq");
    assert_eq!(res.code, -libc::EIO);
    assert!(host.vtables().refs(KINS_VTABLE, KINS_VERSION).is_none());

    // follower needs the kins vtable
    let res = host.execute_line("loadrt follower");
    assert_eq!(res.code, -libc::ENOENT);

    assert!(host.loaded().is_empty());
    assert_eq!(object_count(&host), before);
    assert!(host.functions().is_empty());
}

#[test]
fn unloading_twice_reports_not_found() {
    let mut host = host();
    assert!(host.execute_line("loadrt logic").is_ok());
    assert!(host.execute_line("unloadrt logic").is_ok());
    let after = object_count(&host);

    let res = host.execute_line("unloadrt logic");
    assert_eq!(res.code, -libc::ENOENT);
    assert_eq!(object_count(&host), after);
    assert!(host.functions().is_empty());
}

#[test]
fn referenced_vtables_block_unload() {
    let mut host = host();
    run_script(&mut host, "loadrt kins coordinates=xyzc\nloadrt follower").unwrap();
    assert_eq!(host.vtables().refs(KINS_VTABLE, KINS_VERSION), Some(1));
    {
        let g = host.store().lock().unwrap();
        assert_eq!(g.param_get("follower.joints").unwrap(), HalValue::U32(4));
    }

    let res = host.execute_line("unloadrt kins");
    assert_eq!(res.code, -libc::EBUSY);
    assert_eq!(host.loaded(), vec!["kins", "follower"]);

    assert!(host.execute_line("unloadrt follower").is_ok());
    assert_eq!(host.vtables().refs(KINS_VTABLE, KINS_VERSION), Some(0));
    assert!(host.execute_line("unloadrt kins").is_ok());
    assert!(host.vtables().refs(KINS_VTABLE, KINS_VERSION).is_none());
}

#[test]
fn unload_all_defers_vtable_exporters() {
    let mut host = host();
    // recorder is loaded before kins, so a plain reverse walk would tear
    // kins down first
    run_script(
        &mut host,
        "loadrt recorder\nloadrt kins\nloadrt follower\nloadrt scale\nnewinst scale s0",
    )
    .unwrap();

    host.unload("all").unwrap();
    assert!(KINS_SEEN_AT_STOP.load(Ordering::SeqCst));
    assert!(host.loaded().is_empty());
    assert!(host.functions().is_empty());
    assert!(host.vtables().refs(KINS_VTABLE, KINS_VERSION).is_none());
    let mut g = host.store().lock().unwrap();
    assert_eq!(g.count(&ObjectFilter::of_type(ObjectType::Component)), 0);
    assert_eq!(g.count(&ObjectFilter::of_type(ObjectType::Instance)), 0);
}

#[test]
fn instances_come_and_go() {
    let mut host = host();
    run_script(
        &mut host,
        "loadrt scale\nnewinst scale s0 gain=2\nnewinst scale s1 offset=-1",
    )
    .unwrap();
    assert_eq!(host.instances_of("scale"), vec!["s0", "s1"]);
    assert_eq!(host.functions().names_of("scale"), vec!["s0.update", "s1.update"]);
    {
        let g = host.store().lock().unwrap();
        assert_eq!(g.param_get("s0.gain").unwrap(), HalValue::Float(2.0));
        assert_eq!(g.param_get("s1.offset").unwrap(), HalValue::Float(-1.0));
        assert_eq!(g.inst_info("s0").unwrap().args, "gain=2");
    }

    let res = host.execute_line("newinst scale s2 bogus=1");
    assert_eq!(res.code, -libc::EINVAL);
    assert!(host.store().lock().unwrap().find(ObjectType::Instance, "s2").is_none());

    let res = host.execute_line("newinst logic l0");
    assert_eq!(res.code, -libc::ENOENT);
    run_script(&mut host, "loadrt logic").unwrap();
    let res = host.execute_line("newinst logic l0");
    assert_eq!(res.code, -libc::ENOSYS);

    assert!(host.execute_line("delinst s0").is_ok());
    assert_eq!(host.instances_of("scale"), vec!["s1"]);
    assert_eq!(host.functions().names_of("scale"), vec!["s1.update"]);
    let g = host.store().lock().unwrap();
    assert!(g.find(ObjectType::Pin, "s0.in").is_none());
    assert!(g.find(ObjectType::Function, "s0.update").is_none());
}

#[test]
fn threads_run_module_functions() {
    let mut host = host();
    run_script(
        &mut host,
        "loadrt scale
         newinst scale s0 gain=2 offset=1
         newthread fast 1000000 fp
         addf s0.update fast
         net x s0.in
         sets x 3
         start",
    )
    .unwrap();
    assert_eq!(host.threads().names(), vec!["fast"]);

    let deadline = Instant::now() + Duration::from_secs(2);
    let out = loop {
        let v = host.store().lock().unwrap().pin_get("s0.out").unwrap();
        if v == HalValue::Float(7.0) || Instant::now() > deadline {
            break v;
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(out, HalValue::Float(7.0));

    // unloading while the thread runs drops the function from it
    assert!(host.execute_line("unloadrt scale").is_ok());
    let info = host.store().lock().unwrap().thread_info("fast").unwrap();
    assert!(info.functs.is_empty());
    assert!(info.cycles > 0);

    assert!(host.execute_line("delthread fast").is_ok());
    assert!(host.threads().is_empty());
    host.shutdown().unwrap();
}

#[test]
fn nofp_threads_refuse_fp_functions() {
    let mut host = host();
    run_script(&mut host, "loadrt scale\nnewinst scale s0\nnewthread slow 10000000 nofp").unwrap();
    let res = host.execute_line("addf s0.update slow");
    assert!(!res.is_ok());
    host.shutdown().unwrap();
    assert!(host.threads().is_empty());
    assert!(host.store().lock().unwrap().find(ObjectType::Thread, "slow").is_none());
}

#[test]
fn host_errors_carry_codes() {
    assert_eq!(HostError::ModuleNotFound("x".into()).code(), -libc::ENOENT);
}
