//! Int8 NHWC transposed convolution lowered to an implicit GEMM on tensor cores.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::backend::device::ComputeBackend;
use crate::backend::spec::{BackendError, BackendResult, DTypeEnum, TensorLayout};
use crate::conv::workspace::WorkspaceBundle;
use crate::layout::Format;
use crate::library::{
    Conv2dProblemSize, ConvMode, ConvolutionArguments, EpilogueScalars, KernelLibrary,
};

use super::catalog::{find_kernel, AlgoParam};
use super::deconv_helper::{DeconvInt8Helper, FilterReorder};
use super::{BackwardDataAlgorithm, ExecArgs, SizeArgs};

/// Oldest architecture with int8 tensor-core MMA.
const MIN_COMPUTE_CAPABILITY: (u32, u32) = (7, 5);

pub struct AlgoInt8NhwcImmaImplicitGemm<B: ComputeBackend> {
    algo_param: AlgoParam,
    name: String,
    library: Arc<KernelLibrary<B>>,
}

impl<B: ComputeBackend> AlgoInt8NhwcImmaImplicitGemm<B> {
    pub fn new(algo_param: AlgoParam, library: Arc<KernelLibrary<B>>) -> Self {
        Self {
            name: format!("INT8_NHWC_IMMA_IMPLICIT_GEMM_{algo_param}"),
            algo_param,
            library,
        }
    }

    pub fn algo_param(&self) -> &AlgoParam {
        &self.algo_param
    }

    fn workspace_bundle(&self, args: &SizeArgs) -> WorkspaceBundle {
        WorkspaceBundle::new([args.filter_layout.dense_bytes()], 1)
    }

    /// First failed applicability condition, if any.
    pub fn unavailable_reason(&self, backend: &B, args: &SizeArgs) -> Option<&'static str> {
        let fm = &args.filter_meta;
        if fm.format != Format::NHWC {
            return Some("format is not NHWC");
        }
        if !args.grad_layout.is_contiguous() || !args.diff_layout.is_contiguous() {
            return Some("diff or grad is not contiguous");
        }
        let all_qint8 = [&args.diff_layout, &args.filter_layout, &args.grad_layout]
            .iter()
            .all(|layout| layout.dtype.enumv() == DTypeEnum::QuantizedS8);
        if !all_qint8 {
            return Some("operands are not QuantizedS8");
        }
        if fm.group != 1 {
            return Some("group convolution");
        }
        if fm.should_flip {
            return Some("mode is not cross-correlation");
        }
        if fm.spatial_ndim != 2 {
            return Some("not a 2D convolution");
        }
        if fm.dilation != [1, 1] {
            return Some("dilated filter");
        }
        if fm.filter_area() > self.algo_param.max_filter_pixels() {
            return Some("filter too large");
        }
        let co = args.diff_layout.dim(3);
        let ci = args.grad_layout.dim(3);
        if ci % 4 != 0 || co % self.algo_param.access_size as usize != 0 {
            return Some("channels not aligned to access size");
        }
        if find_kernel(&self.library, args, &self.algo_param).is_none() {
            return Some("no matching kernel in library");
        }
        let (major, minor) = MIN_COMPUTE_CAPABILITY;
        if !backend.is_compute_capability_required(major, minor) {
            return Some("compute capability below sm_75");
        }
        None
    }
}

impl<B: DeconvInt8Helper> BackwardDataAlgorithm<B> for AlgoInt8NhwcImmaImplicitGemm<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self, backend: &B, args: &SizeArgs) -> bool {
        match self.unavailable_reason(backend, args) {
            None => true,
            Some(reason) => {
                trace!(algo = %self.name, reason, "algorithm unavailable");
                false
            }
        }
    }

    fn workspace_in_bytes(&self, args: &SizeArgs) -> usize {
        self.workspace_bundle(args).total_size_in_bytes()
    }

    fn exec(&self, backend: &B, args: &ExecArgs<'_, B>) -> BackendResult<()> {
        let size = args.size;
        if !size.filter_layout.is_contiguous() {
            return Err(BackendError::invalid_argument(format!(
                "{} requires a contiguous filter, got {}",
                self.name, size.filter_layout
            )));
        }
        let op = find_kernel(&self.library, size, &self.algo_param).ok_or_else(|| {
            BackendError::execution(format!("{}: kernel missing from library", self.name))
        })?;

        let bundle = self.workspace_bundle(size);
        let packed_filter = bundle.region(args.workspace, 0)?;
        let fm = &size.filter_meta;
        let reorder = FilterReorder {
            oc: size.diff_layout.dim(3),
            ic: size.grad_layout.dim(3),
            fh: fm.spatial[0],
            fw: fm.spatial[1],
            interleaved: self.algo_param.access_size as usize,
        };
        backend.reorder_filter_nhwc_to_cnxhwx(&packed_filter, args.filter, &reorder)?;

        let epilogue = epilogue_scalars(&size.diff_layout, &size.filter_layout, &size.grad_layout)?;
        let problem_size = problem_size(size)?;
        let conv_args = ConvolutionArguments::<B> {
            problem_size,
            src: args.diff,
            filter: &packed_filter,
            bias: None,
            z: None,
            dst: args.grad,
            epilogue: &epilogue,
            extra_param: None,
            workspace: None,
        };

        debug!(
            algo = %self.name,
            kernel = %op.description().name,
            alpha = epilogue.alpha,
            "launching dgrad kernel"
        );
        let status = op.run(&conv_args, backend.stream());
        if !status.is_success() {
            error!(kernel = %op.description().name, %status, "dgrad kernel launch failed");
            return Err(BackendError::KernelLaunch {
                kernel: op.description().name.clone(),
                status,
            });
        }
        backend.after_kernel_launch()
    }
}

/// Requantization scalars: `alpha = diff_scale * filter_scale / grad_scale`, the rest zero.
pub fn epilogue_scalars(
    diff: &TensorLayout,
    filter: &TensorLayout,
    grad: &TensorLayout,
) -> BackendResult<EpilogueScalars> {
    let scale = |layout: &TensorLayout, what: &str| {
        layout.dtype.scale().ok_or_else(|| {
            BackendError::invalid_argument(format!("{what} dtype {} has no scale", layout.dtype))
        })
    };
    let diff_scale = scale(diff, "diff")?;
    let filter_scale = scale(filter, "filter")?;
    let grad_scale = scale(grad, "grad")?;
    Ok(EpilogueScalars {
        alpha: diff_scale * filter_scale / grad_scale,
        beta: 0.0,
        gamma: 0.0,
        delta: 0.0,
    })
}

fn to_i32(value: usize, what: &'static str) -> BackendResult<i32> {
    i32::try_from(value).map_err(|_| {
        BackendError::invalid_argument(format!("{what} = {value} exceeds the kernel's i32 range"))
    })
}

/// Kernel problem size of an NHWC backward-data problem.
pub fn problem_size(args: &SizeArgs) -> BackendResult<Conv2dProblemSize> {
    let diff = &args.diff_layout;
    let grad = &args.grad_layout;
    let fm = &args.filter_meta;
    Ok(Conv2dProblemSize {
        n: to_i32(diff.dim(0), "batch")?,
        h: to_i32(grad.dim(1), "grad height")?,
        w: to_i32(grad.dim(2), "grad width")?,
        c: to_i32(grad.dim(3), "grad channels")?,
        k: to_i32(diff.dim(3), "diff channels")?,
        r: to_i32(fm.spatial[0], "filter height")?,
        s: to_i32(fm.spatial[1], "filter width")?,
        p: to_i32(diff.dim(1), "diff height")?,
        q: to_i32(diff.dim(2), "diff width")?,
        pad_h: to_i32(fm.padding[0], "pad_h")?,
        pad_w: to_i32(fm.padding[1], "pad_w")?,
        stride_h: to_i32(fm.stride[0], "stride_h")?,
        stride_w: to_i32(fm.stride[1], "stride_w")?,
        dilation_h: to_i32(args.param.dilate_h, "dilate_h")?,
        dilation_w: to_i32(args.param.dilate_w, "dilate_w")?,
        mode: ConvMode::CrossCorrelation,
    })
}
