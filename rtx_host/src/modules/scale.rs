//! `scale`: one gain/offset stage per instance.
//!
//! Each instance `<inst>` exports float pins `<inst>.in` and `<inst>.out`,
//! RW params `<inst>.gain` and `<inst>.offset` (initialised from the
//! `gain=` / `offset=` instance arguments) and the function `<inst>.update`.

use crate::error::{HostError, HostResult};
use crate::module::{ModuleContext, RtModule, parse_arg};
use rtx_hal::{HalType, HalValue, ParamDir, PinDir};
use tracing::debug;

/// Factory function to create a scale module.
pub fn create_module() -> Box<dyn RtModule> {
    Box::new(ScaleModule::default())
}

/// The `scale` module.
#[derive(Debug, Default)]
pub struct ScaleModule {
    instances: Vec<String>,
}

impl ScaleModule {
    /// Instances currently alive, in creation order.
    pub fn instances(&self) -> &[String] {
        &self.instances
    }
}

impl RtModule for ScaleModule {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn start(&mut self, _ctx: &ModuleContext) -> HostResult<()> {
        Ok(())
    }

    fn new_instance(&mut self, ctx: &ModuleContext, args: &[(String, String)]) -> HostResult<()> {
        let mut gain = 1.0;
        let mut offset = 0.0;
        for (key, value) in args {
            match key.as_str() {
                "gain" => gain = parse_arg(self.name(), key, value)?,
                "offset" => offset = parse_arg(self.name(), key, value)?,
                _ => return Err(HostError::param(self.name(), key, "unknown parameter")),
            }
        }

        let input = ctx.pin("in", HalType::Float, PinDir::In)?;
        let output = ctx.pin("out", HalType::Float, PinDir::Out)?;
        let gain = ctx.param("gain", ParamDir::Rw, HalValue::Float(gain))?;
        let offset = ctx.param("offset", ParamDir::Rw, HalValue::Float(offset))?;
        ctx.export_funct("update", true, false, move |_| {
            output.set_f64(input.f64() * gain.f64() + offset.f64());
        })?;

        self.instances.push(ctx.name().to_string());
        debug!("scale instance '{}' ready", ctx.name());
        Ok(())
    }

    fn delete_instance(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        self.instances.retain(|i| i != ctx.name());
        Ok(())
    }
}
