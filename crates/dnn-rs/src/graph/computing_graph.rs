use anyhow::{bail, Result};
use tracing::debug;

use super::{NodeBuilder, OperatorNodeConfig, ResizeParam, VarNode};

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorKind {
    /// Externally provided value.
    Input,
    Resize(ResizeParam),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub name: String,
    pub kind: OperatorKind,
    pub inputs: Vec<VarNode>,
    pub output: VarNode,
}

/// Append-only graph of operator nodes, each with a single output variable.
#[derive(Debug, Default)]
pub struct ComputingGraph {
    operators: Vec<OperatorNode>,
    /// Owning operator of every variable, indexed by `VarNode`.
    owners: Vec<usize>,
}

impl ComputingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>) -> VarNode {
        self.push(name.into(), OperatorKind::Input, Vec::new())
    }

    pub fn operators(&self) -> &[OperatorNode] {
        &self.operators
    }

    pub fn var_count(&self) -> usize {
        self.owners.len()
    }

    pub fn contains(&self, var: VarNode) -> bool {
        (var.0 as usize) < self.owners.len()
    }

    /// Operator producing `var`.
    pub fn owner(&self, var: VarNode) -> Option<&OperatorNode> {
        self.owners
            .get(var.0 as usize)
            .map(|&index| &self.operators[index])
    }

    fn push(&mut self, name: String, kind: OperatorKind, inputs: Vec<VarNode>) -> VarNode {
        let output = VarNode(self.owners.len() as u32);
        self.owners.push(self.operators.len());
        self.operators.push(OperatorNode {
            name,
            kind,
            inputs,
            output,
        });
        output
    }

    fn check_inputs(&self, inputs: &[VarNode]) -> Result<()> {
        for &var in inputs {
            if !self.contains(var) {
                bail!("{var} does not belong to this graph");
            }
        }
        Ok(())
    }
}

impl NodeBuilder for ComputingGraph {
    fn build_resize_node(
        &mut self,
        source: VarNode,
        target_shape: VarNode,
        param: &ResizeParam,
        config: OperatorNodeConfig,
    ) -> Result<VarNode> {
        self.check_inputs(&[source, target_shape])?;
        let name = config
            .name
            .unwrap_or_else(|| format!("resize{}", self.operators.len()));
        let output = self.push(
            name,
            OperatorKind::Resize(*param),
            vec![source, target_shape],
        );
        debug!(%output, "resize node added");
        Ok(output)
    }
}
