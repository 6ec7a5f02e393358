//! Precompiled convolution kernel library.
//!
//! Kernels are identified by a structural [`ConvolutionKey`]: operator kind, element types,
//! layouts, tile shapes, epilogue and optional special-case flag. A key must mirror exactly the
//! variant registered at library build time, otherwise the lookup finds nothing.

mod table;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::device::ComputeBackend;

pub use table::{KernelLibrary, OperationTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericTypeId {
    S8,
    S32,
    F16,
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayoutTypeId {
    TensorNHWC,
    TensorNCHW,
    TensorNC4HW4,
    TensorNC32HW32,
    TensorCK4RS4,
    TensorCK8RS8,
    TensorCK16RS16,
}

impl LayoutTypeId {
    pub fn name(self) -> &'static str {
        match self {
            LayoutTypeId::TensorNHWC => "NHWC",
            LayoutTypeId::TensorNCHW => "NCHW",
            LayoutTypeId::TensorNC4HW4 => "NC4HW4",
            LayoutTypeId::TensorNC32HW32 => "NC32HW32",
            LayoutTypeId::TensorCK4RS4 => "CK4RS4",
            LayoutTypeId::TensorCK8RS8 => "CK8RS8",
            LayoutTypeId::TensorCK16RS16 => "CK16RS16",
        }
    }

    /// Interleave factor of the output-channel axis for `CKxRSx` filter layouts.
    pub fn filter_interleave(self) -> Option<usize> {
        match self {
            LayoutTypeId::TensorCK4RS4 => Some(4),
            LayoutTypeId::TensorCK8RS8 => Some(8),
            LayoutTypeId::TensorCK16RS16 => Some(16),
            _ => None,
        }
    }
}

impl fmt::Display for LayoutTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which convolution pass a kernel implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvOperator {
    Fprop,
    Dgrad,
    Wgrad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvType {
    Convolution,
    BatchConvolution,
    Local,
    LocalShare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpilogueType {
    LinearCombination,
    LinearCombinationClamp,
    BiasAddLinearCombination,
    BiasAddLinearCombinationClamp,
    BiasAddLinearCombinationRelu,
    BiasAddLinearCombinationReluClamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialOptimizeDesc {
    None,
    /// Stride-2 transposed convolution, the usual 2x upsampling layer.
    DeconvDoubleUpsampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvMode {
    Convolution,
    CrossCorrelation,
}

/// `(m, n, k)` extents of a threadblock, warp or instruction tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl GemmShape {
    pub const fn new(m: u32, n: u32, k: u32) -> Self {
        Self { m, n, k }
    }
}

impl fmt::Display for GemmShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// Structural signature of a compiled convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvolutionKey {
    pub conv_op: ConvOperator,
    pub element_src: NumericTypeId,
    pub layout_src: LayoutTypeId,
    pub element_filter: NumericTypeId,
    pub layout_filter: LayoutTypeId,
    pub element_dst: NumericTypeId,
    pub layout_dst: LayoutTypeId,
    pub element_bias: NumericTypeId,
    pub layout_bias: LayoutTypeId,
    pub conv_type: ConvType,
    pub threadblock_shape: GemmShape,
    pub warp_shape: GemmShape,
    pub instruction_shape: GemmShape,
    pub epilogue_type: EpilogueType,
    pub stages: u32,
    pub special_optimization: SpecialOptimizeDesc,
    pub without_shared_load: bool,
}

impl fmt::Display for ConvolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}_{:?}{}_{:?}{}_{:?}{}_tb{}_warp{}_inst{}_{:?}_{}stage",
            self.conv_op,
            self.element_src,
            self.layout_src,
            self.element_filter,
            self.layout_filter,
            self.element_dst,
            self.layout_dst,
            self.threadblock_shape,
            self.warp_shape,
            self.instruction_shape,
            self.epilogue_type,
            self.stages,
        )?;
        if self.special_optimization != SpecialOptimizeDesc::None {
            write!(f, "_{:?}", self.special_optimization)?;
        }
        Ok(())
    }
}

/// Integer extents of one 2D convolution problem, as consumed by the kernels.
///
/// For backward-data the "input" is the gradient being produced (`n, h, w, c`) and the "output"
/// is the incoming gradient (`p, q, k`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dProblemSize {
    pub n: i32,
    pub h: i32,
    pub w: i32,
    pub c: i32,
    pub k: i32,
    pub r: i32,
    pub s: i32,
    pub p: i32,
    pub q: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub mode: ConvMode,
}

/// Scalars of the fused epilogue.
///
/// `dst = clamp(alpha * acc + beta * bias + gamma * z + delta)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpilogueScalars {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub delta: f32,
}

/// Operands of a single kernel invocation.
///
/// Optional tensors that an operation does not use are `None`.
pub struct ConvolutionArguments<'a, B: ComputeBackend> {
    pub problem_size: Conv2dProblemSize,
    pub src: &'a B::Buffer,
    pub filter: &'a B::Buffer,
    pub bias: Option<&'a B::Buffer>,
    pub z: Option<&'a B::Buffer>,
    pub dst: &'a B::Buffer,
    pub epilogue: &'a EpilogueScalars,
    pub extra_param: Option<&'a B::Buffer>,
    pub workspace: Option<&'a B::Buffer>,
}

/// Completion status reported by a kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    ErrorMisalignedOperand,
    ErrorInvalidProblem,
    ErrorNotSupported,
    ErrorWorkspaceNull,
    ErrorInternal,
    ErrorArchMismatch,
    ErrorInsufficientDriver,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::ErrorMisalignedOperand => "misaligned operand",
            Status::ErrorInvalidProblem => "invalid problem",
            Status::ErrorNotSupported => "not supported",
            Status::ErrorWorkspaceNull => "workspace null",
            Status::ErrorInternal => "internal error",
            Status::ErrorArchMismatch => "architecture mismatch",
            Status::ErrorInsufficientDriver => "insufficient driver",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a compiled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescription {
    pub name: String,
    pub key: ConvolutionKey,
}

/// A compiled kernel that can be launched on a backend stream.
pub trait Operation<B: ComputeBackend>: Send + Sync {
    fn description(&self) -> &OperationDescription;

    /// Enqueues the kernel on `stream`.
    fn run(&self, args: &ConvolutionArguments<'_, B>, stream: &B::Stream) -> Status;
}
