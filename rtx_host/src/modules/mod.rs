//! Built-in modules.
//!
//! - [`scale`] - instantiable `out = in * gain + offset`
//! - [`logic`] - AND/OR over a configurable number of bit inputs
//! - [`kins`] - trivial kinematics exported as a shared vtable
//!
//! # Adding New Modules
//!
//! 1. Create a new submodule under `modules/`
//! 2. Implement the `RtModule` trait from `crate::module`
//! 3. Register its factory in [`register_builtin_modules`]

pub mod kins;
pub mod logic;
pub mod scale;

use crate::registry::ModuleRegistry;

/// Register all built-in modules.
pub fn register_builtin_modules(reg: &mut ModuleRegistry) {
    reg.register("scale", scale::create_module);
    reg.register("logic", logic::create_module);
    reg.register("kins", kins::create_module);
}
