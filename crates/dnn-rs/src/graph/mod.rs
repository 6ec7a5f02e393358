//! Computing-graph side of operator definitions.
//!
//! An [`OpDef`] is an immutable description of an operator. Applying it to variable nodes asks a
//! [`NodeBuilder`] to materialize the matching operator node; the definition is only read, never
//! retained by the graph.

pub mod computing_graph;
pub mod resize;

use std::fmt;

use anyhow::Result;

pub use computing_graph::{ComputingGraph, OperatorKind, OperatorNode};
pub use resize::{InterpolationMode, Resize, ResizeParam};

/// Handle of a variable (an operator output) inside a computing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarNode(pub u32);

impl fmt::Display for VarNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}", self.0)
    }
}

pub type VarNodeArray = Vec<VarNode>;

/// Per-node construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorNodeConfig {
    pub name: Option<String>,
}

impl OperatorNodeConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Graph-side factory for operator nodes.
pub trait NodeBuilder {
    /// Adds a resize node reading `source` with target spatial size taken from `target_shape`.
    fn build_resize_node(
        &mut self,
        source: VarNode,
        target_shape: VarNode,
        param: &ResizeParam,
        config: OperatorNodeConfig,
    ) -> Result<VarNode>;
}

/// Immutable operator definition that can be lowered onto a computing graph.
pub trait OpDef: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Explicit scope name given by the user, if any.
    fn scope(&self) -> Option<&str>;

    /// Name given to nodes built from this definition: the scope when set, else the type name.
    fn make_name(&self) -> String {
        match self.scope() {
            Some(scope) if !scope.is_empty() => scope.to_string(),
            _ => self.type_name().to_string(),
        }
    }

    fn apply_on_var_node(
        &self,
        inputs: &[VarNode],
        builder: &mut dyn NodeBuilder,
    ) -> Result<VarNode>;
}
