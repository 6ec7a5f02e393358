use std::sync::Arc;

use dnn_rs::conv::backward_data::catalog::{dgrad_key, INT8_NHWC_IMMA_ALGO_PARAMS};
use dnn_rs::library::{
    Conv2dProblemSize, ConvMode, ConvolutionArguments, ConvolutionKey, KernelLibrary,
    Operation, OperationDescription, OperationTable, SpecialOptimizeDesc, Status,
};
use dnn_rs::BufferRegion;
use tracing::trace;

use crate::cpu::{CpuBackend, HostStream};

/// Host implementation of the int8 NHWC dgrad kernel family.
///
/// Reads the filter in the interleaved `CKxRSx` layout named by the key, accumulates in a
/// two's-complement `i32` that wraps on overflow like the device accumulator, and requantizes with `round-half-even(alpha * acc + delta)` clamped to the `i8` range.
pub struct HostDgradOperation {
    description: OperationDescription,
    interleave: usize,
}

impl HostDgradOperation {
    pub fn new(key: ConvolutionKey) -> Option<Self> {
        let interleave = key.layout_filter.filter_interleave()?;
        let mut name = format!(
            "host_s8_dgrad_nhwc_{}_tb{}_warp{}_{}stage",
            key.layout_filter, key.threadblock_shape, key.warp_shape, key.stages
        );
        if key.special_optimization == SpecialOptimizeDesc::DeconvDoubleUpsampling {
            name.push_str("_upsample2x");
        }
        Some(Self {
            description: OperationDescription { name, key },
            interleave,
        })
    }
}

struct Extents {
    n: usize,
    h: usize,
    w: usize,
    c: usize,
    k: usize,
    r: usize,
    s: usize,
    p: usize,
    q: usize,
}

fn extents(problem: &Conv2dProblemSize) -> Option<Extents> {
    let dim = |value: i32| usize::try_from(value).ok().filter(|&v| v > 0);
    Some(Extents {
        n: dim(problem.n)?,
        h: dim(problem.h)?,
        w: dim(problem.w)?,
        c: dim(problem.c)?,
        k: dim(problem.k)?,
        r: dim(problem.r)?,
        s: dim(problem.s)?,
        p: dim(problem.p)?,
        q: dim(problem.q)?,
    })
}

fn requantize(acc: i32, alpha: f32, delta: f32) -> i8 {
    let value = (alpha * acc as f32 + delta).round_ties_even();
    value.clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

impl Operation<CpuBackend> for HostDgradOperation {
    fn description(&self) -> &OperationDescription {
        &self.description
    }

    fn run(&self, args: &ConvolutionArguments<'_, CpuBackend>, stream: &HostStream) -> Status {
        let problem = &args.problem_size;
        let Some(ext) = extents(problem) else {
            return Status::ErrorInvalidProblem;
        };
        if problem.mode != ConvMode::CrossCorrelation
            || problem.stride_h <= 0
            || problem.stride_w <= 0
            || problem.dilation_h <= 0
            || problem.dilation_w <= 0
            || problem.pad_h < 0
            || problem.pad_w < 0
        {
            return Status::ErrorInvalidProblem;
        }
        if ext.k % self.interleave != 0 {
            return Status::ErrorMisalignedOperand;
        }
        if args.bias.is_some() || args.z.is_some() {
            return Status::ErrorNotSupported;
        }
        let src_len = ext.n * ext.p * ext.q * ext.k;
        let filter_len = ext.k * ext.r * ext.s * ext.c;
        let dst_len = ext.n * ext.h * ext.w * ext.c;
        if args.src.byte_len() < src_len
            || args.filter.byte_len() < filter_len
            || args.dst.byte_len() < dst_len
        {
            return Status::ErrorInvalidProblem;
        }

        if let Some(status) = stream.begin_launch(&self.description) {
            return status;
        }
        trace!(kernel = %self.description.name, ?problem, "running host dgrad");

        let diff = args.src.to_vec();
        let filter = args.filter.to_vec();
        let x = self.interleave;
        let area = ext.r * ext.s;
        let (stride_h, stride_w) = (problem.stride_h as isize, problem.stride_w as isize);
        let (pad_h, pad_w) = (problem.pad_h as isize, problem.pad_w as isize);
        let (dil_h, dil_w) = (problem.dilation_h as isize, problem.dilation_w as isize);
        let epilogue = args.epilogue;

        let mut grad = vec![0i8; dst_len];
        for n in 0..ext.n {
            for ih in 0..ext.h {
                for iw in 0..ext.w {
                    for ic in 0..ext.c {
                        let mut acc = 0i32;
                        for r in 0..ext.r {
                            let oh_scaled = ih as isize + pad_h - r as isize * dil_h;
                            if oh_scaled < 0 || oh_scaled % stride_h != 0 {
                                continue;
                            }
                            let oh = (oh_scaled / stride_h) as usize;
                            if oh >= ext.p {
                                continue;
                            }
                            for s in 0..ext.s {
                                let ow_scaled = iw as isize + pad_w - s as isize * dil_w;
                                if ow_scaled < 0 || ow_scaled % stride_w != 0 {
                                    continue;
                                }
                                let ow = (ow_scaled / stride_w) as usize;
                                if ow >= ext.q {
                                    continue;
                                }
                                let diff_row = ((n * ext.p + oh) * ext.q + ow) * ext.k;
                                let tap = (r * ext.s + s) * x;
                                for oc in 0..ext.k {
                                    let packed = ic * (ext.k * area)
                                        + (oc / x) * (area * x)
                                        + tap
                                        + oc % x;
                                    let product =
                                        i32::from(diff[diff_row + oc]) * i32::from(filter[packed]);
                                    acc = acc.wrapping_add(product);
                                }
                            }
                        }
                        grad[((n * ext.h + ih) * ext.w + iw) * ext.c + ic] =
                            requantize(acc, epilogue.alpha, epilogue.delta);
                    }
                }
            }
        }

        match args.dst.write(&grad) {
            Ok(()) => Status::Success,
            Err(_) => Status::ErrorInternal,
        }
    }
}

/// Registers the host dgrad kernels for every catalog configuration, with and without the
/// stride-2 upsampling specialization.
pub fn register_reference_dgrad_kernels(table: &mut OperationTable<CpuBackend>) {
    for param in INT8_NHWC_IMMA_ALGO_PARAMS.iter() {
        for stride in [[1, 1], [2, 2]] {
            if let Some(op) = HostDgradOperation::new(dgrad_key(param, stride)) {
                table.append(Arc::new(op));
            }
        }
    }
}

/// Kernel library populated with the host dgrad kernels on first use.
pub fn reference_library() -> Arc<KernelLibrary<CpuBackend>> {
    Arc::new(KernelLibrary::lazy(register_reference_dgrad_kernels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requantize_rounds_half_to_even_and_saturates() {
        assert_eq!(requantize(5, 0.5, 0.0), 2);
        assert_eq!(requantize(7, 0.5, 0.0), 4);
        assert_eq!(requantize(-5, 0.5, 0.0), -2);
        assert_eq!(requantize(1000, 1.0, 0.0), 127);
        assert_eq!(requantize(-1000, 1.0, 0.0), -128);
    }

    #[test]
    fn registers_both_stride_variants_per_configuration() {
        let mut table = OperationTable::new();
        register_reference_dgrad_kernels(&mut table);
        assert_eq!(table.len(), 12);
    }
}
