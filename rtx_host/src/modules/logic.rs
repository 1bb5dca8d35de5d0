//! `logic`: AND and OR over `count` bit inputs.

use crate::error::{HostError, HostResult};
use crate::module::{ModuleContext, RtModule, parse_arg};
use rtx_hal::{HalType, HalValue, ParamDir, PinDir};

const MAX_INPUTS: u32 = 16;

/// Factory function to create a logic module.
pub fn create_module() -> Box<dyn RtModule> {
    Box::new(LogicModule { count: 2 })
}

/// The `logic` module.
///
/// Exports `logic.in-NN` inputs, `logic.and` / `logic.or` outputs, the RO
/// param `logic.count` and the function `logic.update`.
#[derive(Debug)]
pub struct LogicModule {
    count: u32,
}

impl RtModule for LogicModule {
    fn name(&self) -> &'static str {
        "logic"
    }

    fn set_param(&mut self, key: &str, value: &str) -> HostResult<()> {
        match key {
            "count" => {
                let count: u32 = parse_arg(self.name(), key, value)?;
                if !(1..=MAX_INPUTS).contains(&count) {
                    return Err(HostError::param(
                        self.name(),
                        key,
                        format!("must be 1..={MAX_INPUTS}"),
                    ));
                }
                self.count = count;
                Ok(())
            }
            _ => Err(HostError::param(self.name(), key, "unknown parameter")),
        }
    }

    fn start(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        let inputs = (0..self.count)
            .map(|i| ctx.pin(&format!("in-{i:02}"), HalType::Bit, PinDir::In))
            .collect::<HostResult<Vec<_>>>()?;
        let and = ctx.pin("and", HalType::Bit, PinDir::Out)?;
        let or = ctx.pin("or", HalType::Bit, PinDir::Out)?;
        ctx.param("count", ParamDir::Ro, HalValue::U32(self.count))?;
        ctx.export_funct("update", false, false, move |_| {
            and.set_bit(inputs.iter().all(|p| p.bit()));
            or.set_bit(inputs.iter().any(|p| p.bit()));
        })?;
        Ok(())
    }
}
