//! `save` of a graph built from modules replays on a fresh host.

use rtx_common::flavor::Flavor;
use rtx_hal::{CommandTarget, HalStore, HalValue, run_script};
use rtx_host::{ModuleHost, ModuleRegistry};
use std::sync::Arc;

const SETUP: &str = "
loadrt logic count=2
loadrt scale
newinst scale s0 gain=2
newinst scale s1 offset=0.5
newthread servo 1000000 fp
newthread base 100000 nofp
addf s0.update servo
addf s1.update servo
addf logic.update base
net speed s0.out => s1.in
net both logic.and
setp s1.gain 4
";

fn host() -> ModuleHost {
    let store = Arc::new(HalStore::in_memory(512 * 1024, 512).unwrap());
    ModuleHost::new(store, None, Flavor::Posix, ModuleRegistry::with_builtins())
}

fn saved(host: &mut ModuleHost) -> Vec<String> {
    let res = host.execute_line("save");
    assert!(res.is_ok(), "{:?}", res);
    res.notes
}

#[test]
fn saved_commands_rebuild_the_graph() {
    let mut first = host();
    run_script(&mut first, SETUP).unwrap();
    let script = saved(&mut first);
    assert!(script.contains(&"loadrt logic count=2".to_string()));
    assert!(script.contains(&"newinst scale s0 gain=2".to_string()));

    let mut second = host();
    run_script(&mut second, &script.join("\n")).unwrap();
    assert_eq!(saved(&mut second), script);
    assert_eq!(second.loaded(), first.loaded());
    assert_eq!(second.instances_of("scale"), vec!["s0", "s1"]);

    let g = second.store().lock().unwrap();
    assert_eq!(g.param_get("s1.gain").unwrap(), HalValue::Float(4.0));
    assert_eq!(g.thread_functs("servo").unwrap(), vec!["s0.update", "s1.update"]);
    assert_eq!(g.thread_functs("base").unwrap(), vec!["logic.update"]);
    drop(g);

    first.shutdown().unwrap();
    second.shutdown().unwrap();
}
