use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::layout::Format;

use super::{NodeBuilder, OpDef, OperatorNodeConfig, VarNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterpolationMode {
    Nearest,
    Linear,
    Area,
    Cubic,
    Lanczos4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeParam {
    pub imode: InterpolationMode,
    pub format: Format,
}

impl Default for ResizeParam {
    fn default() -> Self {
        Self {
            imode: InterpolationMode::Linear,
            format: Format::NCHW,
        }
    }
}

/// Spatial resize of a tensor to a runtime-provided target size.
#[derive(Debug, Clone, PartialEq)]
pub struct Resize {
    param: ResizeParam,
    scope: Option<String>,
}

impl Resize {
    pub const TYPE_NAME: &'static str = "Resize";

    pub fn new(param: ResizeParam) -> Self {
        Self { param, scope: None }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn param(&self) -> &ResizeParam {
        &self.param
    }
}

/// Builds the resize node for `def` from `[source, target_shape]`.
///
/// Fails without touching `builder` unless exactly two inputs are given.
pub fn apply_on_var_node(
    def: &Resize,
    inputs: &[VarNode],
    builder: &mut dyn NodeBuilder,
) -> Result<VarNode> {
    ensure!(
        inputs.len() == 2,
        "{} expects 2 inputs (source, target shape), got {}",
        Resize::TYPE_NAME,
        inputs.len()
    );
    let config = OperatorNodeConfig::with_name(def.make_name());
    trace!(name = ?config.name, "building resize node");
    builder.build_resize_node(inputs[0], inputs[1], def.param(), config)
}

impl OpDef for Resize {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn apply_on_var_node(
        &self,
        inputs: &[VarNode],
        builder: &mut dyn NodeBuilder,
    ) -> Result<VarNode> {
        apply_on_var_node(self, inputs, builder)
    }
}
