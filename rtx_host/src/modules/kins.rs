//! `kins`: identity kinematics shared through a vtable.
//!
//! The `coordinates` argument lists one axis letter per joint (default
//! `xyz`). Other modules reference the table as [`TrivKins`] under
//! [`KINS_VTABLE`] v[`KINS_VERSION`].

use crate::error::{HostError, HostResult};
use crate::module::{ModuleContext, RtModule};
use rtx_hal::{HalValue, ParamDir};
use std::sync::Arc;

/// Vtable name.
pub const KINS_VTABLE: &str = "trivkins";

/// Vtable version.
pub const KINS_VERSION: u32 = 1;

/// Axis letters in pose order.
pub const AXES: &str = "xyzabcuvw";

/// Cartesian pose, one value per letter of [`AXES`].
pub type Pose = [f64; 9];

/// Factory function to create a kins module.
pub fn create_module() -> Box<dyn RtModule> {
    Box::new(KinsModule {
        coordinates: "xyz".to_string(),
    })
}

/// Joint to axis mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrivKins {
    axes: Vec<usize>,
}

impl TrivKins {
    /// Mapping for `coordinates`, e.g. `"xyzc"`.
    pub fn new(coordinates: &str) -> Result<Self, String> {
        let axes = coordinates
            .chars()
            .map(|c| {
                AXES.find(c.to_ascii_lowercase())
                    .ok_or_else(|| format!("unknown axis letter '{c}'"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if axes.is_empty() {
            return Err("no coordinates".to_string());
        }
        Ok(Self { axes })
    }

    /// Number of joints.
    pub fn joints(&self) -> usize {
        self.axes.len()
    }

    /// Joint positions to pose. A letter used twice takes the first joint.
    pub fn forward(&self, joints: &[f64], pose: &mut Pose) {
        *pose = [0.0; 9];
        for (j, &axis) in self.axes.iter().enumerate().rev() {
            if let Some(&v) = joints.get(j) {
                pose[axis] = v;
            }
        }
    }

    /// Pose to joint positions.
    pub fn inverse(&self, pose: &Pose, joints: &mut [f64]) {
        for (slot, &axis) in joints.iter_mut().zip(&self.axes) {
            *slot = pose[axis];
        }
    }
}

/// The `kins` module.
#[derive(Debug)]
pub struct KinsModule {
    coordinates: String,
}

impl RtModule for KinsModule {
    fn name(&self) -> &'static str {
        "kins"
    }

    fn set_param(&mut self, key: &str, value: &str) -> HostResult<()> {
        match key {
            "coordinates" => {
                self.coordinates = value.to_string();
                Ok(())
            }
            _ => Err(HostError::param(self.name(), key, "unknown parameter")),
        }
    }

    fn start(&mut self, ctx: &ModuleContext) -> HostResult<()> {
        let kins = TrivKins::new(&self.coordinates).map_err(|reason| HostError::StartFailed {
            module: self.name().to_string(),
            reason,
        })?;
        ctx.param("joints", ParamDir::Ro, HalValue::U32(kins.joints() as u32))?;
        ctx.export_vtable(KINS_VTABLE, KINS_VERSION, Arc::new(kins))
    }

    fn exports_vtable(&self) -> bool {
        true
    }
}
