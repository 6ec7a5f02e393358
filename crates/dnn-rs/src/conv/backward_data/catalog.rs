//! Compiled-in tile configurations of the int8 NHWC implicit-GEMM dgrad kernels and the mapping
//! from a problem to its kernel-library key.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::device::ComputeBackend;
use crate::library::{
    ConvOperator, ConvType, ConvolutionKey, EpilogueType, GemmShape, KernelLibrary, LayoutTypeId,
    NumericTypeId, Operation, SpecialOptimizeDesc,
};

use super::SizeArgs;

/// Instruction tile of the int8 tensor-core MMA.
pub const IMMA_INSTRUCTION_SHAPE: GemmShape = GemmShape::new(8, 8, 16);

/// Tile configuration of one precompiled kernel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgoParam {
    pub threadblock_m: u32,
    pub threadblock_n: u32,
    pub threadblock_k: u32,
    pub warp_m: u32,
    pub warp_n: u32,
    pub warp_k: u32,
    pub stage: u32,
    /// Elements moved per vectorized access; also the filter interleave factor.
    pub access_size: u32,
}

impl AlgoParam {
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        threadblock_m: u32,
        threadblock_n: u32,
        threadblock_k: u32,
        warp_m: u32,
        warp_n: u32,
        warp_k: u32,
        stage: u32,
        access_size: u32,
    ) -> Self {
        Self {
            threadblock_m,
            threadblock_n,
            threadblock_k,
            warp_m,
            warp_n,
            warp_k,
            stage,
            access_size,
        }
    }

    pub fn threadblock_shape(&self) -> GemmShape {
        GemmShape::new(self.threadblock_m, self.threadblock_n, self.threadblock_k)
    }

    pub fn warp_shape(&self) -> GemmShape {
        GemmShape::new(self.warp_m, self.warp_n, self.warp_k)
    }

    /// Largest filter area the kernel's shared-memory budget accommodates.
    pub fn max_filter_pixels(&self) -> usize {
        let chunks = (self.warp_k / self.access_size).max(1) as usize;
        (848 / chunks).saturating_sub(1)
    }
}

impl fmt::Display for AlgoParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}X{}X{}_{}X{}X{}_{}stage_{}",
            self.threadblock_m,
            self.threadblock_n,
            self.threadblock_k,
            self.warp_m,
            self.warp_n,
            self.warp_k,
            self.stage,
            self.access_size
        )
    }
}

/// Tile configurations in priority order.
pub const INT8_NHWC_IMMA_ALGO_PARAMS: [AlgoParam; 6] = [
    AlgoParam::new(64, 16, 32, 64, 16, 32, 2, 4),
    AlgoParam::new(64, 16, 32, 64, 16, 32, 2, 8),
    AlgoParam::new(64, 16, 32, 64, 16, 32, 2, 16),
    AlgoParam::new(128, 32, 32, 64, 32, 32, 1, 4),
    AlgoParam::new(128, 32, 32, 64, 32, 32, 1, 8),
    AlgoParam::new(128, 32, 32, 64, 32, 32, 1, 16),
];

/// Filter layout the kernel expects for a given access size.
///
/// # Panics
///
/// Panics when `access_size` is not 4, 8 or 16; the catalog never contains such a variant.
pub fn filter_layout_for_access_size(access_size: u32) -> LayoutTypeId {
    match access_size {
        16 => LayoutTypeId::TensorCK16RS16,
        8 => LayoutTypeId::TensorCK8RS8,
        4 => LayoutTypeId::TensorCK4RS4,
        other => panic!("invalid access_size: {other}"),
    }
}

pub fn special_optimization(stride: [usize; 2]) -> SpecialOptimizeDesc {
    if stride == [2, 2] {
        SpecialOptimizeDesc::DeconvDoubleUpsampling
    } else {
        SpecialOptimizeDesc::None
    }
}

/// Library key of the dgrad kernel compiled for `algo_param` and the given filter strides.
pub fn dgrad_key(algo_param: &AlgoParam, stride: [usize; 2]) -> ConvolutionKey {
    ConvolutionKey {
        conv_op: ConvOperator::Dgrad,
        element_src: NumericTypeId::S8,
        layout_src: LayoutTypeId::TensorNHWC,
        element_filter: NumericTypeId::S8,
        layout_filter: filter_layout_for_access_size(algo_param.access_size),
        element_dst: NumericTypeId::S8,
        layout_dst: LayoutTypeId::TensorNHWC,
        element_bias: NumericTypeId::S32,
        layout_bias: LayoutTypeId::TensorNHWC,
        conv_type: ConvType::Convolution,
        threadblock_shape: algo_param.threadblock_shape(),
        warp_shape: algo_param.warp_shape(),
        instruction_shape: IMMA_INSTRUCTION_SHAPE,
        epilogue_type: EpilogueType::BiasAddLinearCombinationClamp,
        stages: algo_param.stage,
        special_optimization: special_optimization(stride),
        without_shared_load: false,
    }
}

/// Looks up the kernel matching `args` and `algo_param`; `None` when the library lacks it.
pub fn find_kernel<B: ComputeBackend>(
    library: &KernelLibrary<B>,
    args: &SizeArgs,
    algo_param: &AlgoParam,
) -> Option<Arc<dyn Operation<B>>> {
    library.find_op(&dgrad_key(algo_param, args.filter_meta.stride))
}
