use std::sync::Arc;

use anyhow::Result;
use dnn_rs::backend::device::ComputeBackend;
use dnn_rs::conv::backward_data::deconv_helper::FilterReorder;
use dnn_rs::conv::backward_data::int8_nhwc_imma::{epilogue_scalars, problem_size};
use dnn_rs::conv::backward_data::{BackwardDataAlgorithm, ExecArgs, INT8_NHWC_IMMA_ALGO_PARAMS};
use dnn_rs::conv::{Mode, Sparse};
use dnn_rs::library::{ConvMode, KernelLibrary, LayoutTypeId, OperationDescription, Status};
use dnn_rs::{
    AlgoInt8NhwcImmaImplicitGemm, AlgoPolicy, BackendError, ComputeCapability,
    ConvolutionBackwardData, ConvolutionParam, DType, DeconvInt8Helper, SizeArgs, TensorLayout,
    TensorNd,
};
use dnn_rs_backend_ref_cpu::{
    reference_library, CpuBackend, CpuKernelInterceptor, HostBuffer,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn qs8(scale: f32) -> DType {
    DType::QuantizedS8 { scale }
}

/// Layouts of an NHWC deconvolution producing `grad` of `n x hi x wi x ci` from `co` channels.
struct Problem {
    param: ConvolutionParam,
    filter: TensorLayout,
    diff: TensorLayout,
    grad: TensorLayout,
}

impl Problem {
    #[allow(clippy::too_many_arguments)]
    fn new(
        n: usize,
        hi: usize,
        wi: usize,
        ci: usize,
        co: usize,
        filter: (usize, usize),
        stride: (usize, usize),
        pad: (usize, usize),
    ) -> Self {
        let param = ConvolutionParam::nhwc()
            .with_stride(stride.0, stride.1)
            .with_padding(pad.0, pad.1);
        let ho = (hi + 2 * pad.0 - filter.0) / stride.0 + 1;
        let wo = (wi + 2 * pad.1 - filter.1) / stride.1 + 1;
        Self {
            param,
            filter: TensorLayout::contiguous([co, filter.0, filter.1, ci], qs8(1.0)),
            diff: TensorLayout::contiguous([n, ho, wo, co], qs8(1.0)),
            grad: TensorLayout::contiguous([n, hi, wi, ci], qs8(1.0)),
        }
    }

    fn upsample_64() -> Self {
        Self::new(1, 32, 32, 64, 64, (3, 3), (2, 2), (1, 1))
    }

    fn scales(mut self, diff: f32, filter: f32, grad: f32) -> Self {
        self.diff.dtype = qs8(diff);
        self.filter.dtype = qs8(filter);
        self.grad.dtype = qs8(grad);
        self
    }

    fn size_args(&self) -> Result<SizeArgs> {
        Ok(SizeArgs::new(&self.param, &self.filter, &self.diff, &self.grad)?)
    }
}

fn imma_algo(
    library: &Arc<KernelLibrary<CpuBackend>>,
    access_size: u32,
) -> AlgoInt8NhwcImmaImplicitGemm<CpuBackend> {
    let param = INT8_NHWC_IMMA_ALGO_PARAMS
        .iter()
        .find(|param| param.access_size == access_size)
        .copied()
        .expect("catalog has every access size");
    AlgoInt8NhwcImmaImplicitGemm::new(param, Arc::clone(library))
}

fn random_i8(rng: &mut StdRng, len: usize) -> Vec<i8> {
    (0..len).map(|_| rng.gen_range(-8i8..8)).collect()
}

/// Scatter formulation of NHWC transposed convolution with an `OHWI` filter.
fn naive_deconv(problem: &Problem, diff: &[i8], filter: &[i8], alpha: f32) -> Vec<i8> {
    let [n, ho, wo, co] = <[usize; 4]>::try_from(problem.diff.shape.as_slice()).unwrap();
    let [_, hi, wi, ci] = <[usize; 4]>::try_from(problem.grad.shape.as_slice()).unwrap();
    let (fh, fw) = (problem.filter.dim(1), problem.filter.dim(2));
    let p = &problem.param;
    let mut acc = vec![0i32; n * hi * wi * ci];
    for b in 0..n {
        for oh in 0..ho {
            for ow in 0..wo {
                for oc in 0..co {
                    let d = diff[((b * ho + oh) * wo + ow) * co + oc] as i32;
                    for r in 0..fh {
                        for s in 0..fw {
                            let ih = (oh * p.stride_h + r) as isize - p.pad_h as isize;
                            let iw = (ow * p.stride_w + s) as isize - p.pad_w as isize;
                            if ih < 0 || iw < 0 || ih >= hi as isize || iw >= wi as isize {
                                continue;
                            }
                            let (ih, iw) = (ih as usize, iw as usize);
                            for ic in 0..ci {
                                let f = filter[((oc * fh + r) * fw + s) * ci + ic] as i32;
                                acc[((b * hi + ih) * wi + iw) * ci + ic] += d * f;
                            }
                        }
                    }
                }
            }
        }
    }
    acc.into_iter()
        .map(|value| {
            (alpha * value as f32)
                .round_ties_even()
                .clamp(-128.0, 127.0) as i8
        })
        .collect()
}

#[test]
fn upsampling_layer_is_available_with_ck8rs8_kernel() -> Result<()> {
    let library = reference_library();
    let backend = CpuBackend::with_compute_capability(ComputeCapability::new(7, 5));
    let args = Problem::upsample_64().size_args()?;
    let algo = imma_algo(&library, 8);

    assert!(algo.is_available(&backend, &args));
    assert_eq!(algo.workspace_in_bytes(&args), 64 * 64 * 3 * 3);
    assert_eq!(algo.workspace_in_bytes(&args), 36864);
    assert_eq!(
        algo.name(),
        "INT8_NHWC_IMMA_IMPLICIT_GEMM_64X16X32_64X16X32_2stage_8"
    );

    let op = dnn_rs::conv::backward_data::catalog::find_kernel(&library, &args, algo.algo_param())
        .expect("kernel registered");
    let key = op.description().key;
    assert_eq!(key.layout_filter, LayoutTypeId::TensorCK8RS8);
    assert_eq!(
        key.special_optimization,
        dnn_rs::library::SpecialOptimizeDesc::DeconvDoubleUpsampling
    );
    Ok(())
}

#[test]
fn unsupported_configurations_are_unavailable() -> Result<()> {
    let library = reference_library();
    let backend = CpuBackend::new();
    let algo = imma_algo(&library, 8);
    let base = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
    assert!(algo.is_available(&backend, &base.size_args()?));

    let mut group = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
    group.param = group.param.with_sparse(Sparse::Group);
    group.filter = TensorLayout::contiguous([2, 8, 3, 3, 8], qs8(1.0));
    assert!(!algo.is_available(&backend, &group.size_args()?));

    let mut dilated = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (2, 2));
    dilated.param = dilated.param.with_dilation(2, 2);
    dilated.diff = TensorLayout::contiguous([1, 8, 8, 16], qs8(1.0));
    assert!(!algo.is_available(&backend, &dilated.size_args()?));

    let mut flipped = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
    flipped.param = flipped.param.with_mode(Mode::Convolution);
    assert!(!algo.is_available(&backend, &flipped.size_args()?));

    for index in 0..3 {
        let mut plain = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
        let layout = match index {
            0 => &mut plain.diff,
            1 => &mut plain.filter,
            _ => &mut plain.grad,
        };
        layout.dtype = DType::Int8;
        assert!(!algo.is_available(&backend, &plain.size_args()?));
    }

    let odd_ci = Problem::new(1, 8, 8, 6, 16, (3, 3), (1, 1), (1, 1));
    assert!(!algo.is_available(&backend, &odd_ci.size_args()?));

    let odd_co = Problem::new(1, 8, 8, 16, 12, (3, 3), (1, 1), (1, 1));
    assert!(!algo.is_available(&backend, &odd_co.size_args()?));
    assert!(imma_algo(&library, 4).is_available(&backend, &odd_co.size_args()?));

    // 15x15 = 225 taps: above the 211-pixel budget of access size 8, within 423 for 16.
    let large = Problem::new(1, 16, 16, 16, 16, (15, 15), (1, 1), (7, 7));
    assert!(!algo.is_available(&backend, &large.size_args()?));
    assert!(imma_algo(&library, 16).is_available(&backend, &large.size_args()?));

    let mut nchw = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
    nchw.param.format = dnn_rs::Format::NCHW;
    nchw.filter = TensorLayout::contiguous([16, 16, 3, 3], qs8(1.0));
    nchw.diff = TensorLayout::contiguous([1, 16, 8, 8], qs8(1.0));
    nchw.grad = TensorLayout::contiguous([1, 16, 8, 8], qs8(1.0));
    assert!(!algo.is_available(&backend, &nchw.size_args()?));

    let mut strided = Problem::new(1, 8, 8, 16, 16, (3, 3), (1, 1), (1, 1));
    strided.grad = TensorLayout::with_strides([1, 8, 8, 16], [2048, 256, 32, 1], qs8(1.0))?;
    assert!(!algo.is_available(&backend, &strided.size_args()?));

    let volta = CpuBackend::with_compute_capability(ComputeCapability::new(7, 0));
    assert!(!algo.is_available(&volta, &base.size_args()?));

    let empty = Arc::new(KernelLibrary::<CpuBackend>::empty());
    assert!(!imma_algo(&empty, 8).is_available(&backend, &base.size_args()?));
    Ok(())
}

#[test]
fn filter_area_budget_is_inclusive() -> Result<()> {
    let library = reference_library();
    let backend = CpuBackend::new();
    for param in INT8_NHWC_IMMA_ALGO_PARAMS.iter() {
        let budget = 848 / (param.warp_k / param.access_size) as usize - 1;
        let algo = AlgoInt8NhwcImmaImplicitGemm::new(*param, Arc::clone(&library));
        for (taps, expected) in [(budget, true), (budget + 1, false)] {
            let row = Problem::new(1, 1, taps, 16, 16, (1, taps), (1, 1), (0, 0));
            assert_eq!(
                algo.is_available(&backend, &row.size_args()?),
                expected,
                "{} with {taps} taps",
                algo.name()
            );
        }
    }
    Ok(())
}

#[test]
fn workspace_is_dense_filter_bytes() -> Result<()> {
    let library = reference_library();
    for (co, ci, fh, fw) in [(16, 8, 3, 3), (64, 64, 1, 1), (32, 4, 5, 3)] {
        let problem = Problem::new(2, 9, 9, ci, co, (fh, fw), (1, 1), (1, 1));
        let args = problem.size_args()?;
        for param in INT8_NHWC_IMMA_ALGO_PARAMS.iter() {
            let algo = AlgoInt8NhwcImmaImplicitGemm::new(*param, Arc::clone(&library));
            assert_eq!(algo.workspace_in_bytes(&args), co * ci * fh * fw);
        }
    }
    Ok(())
}

#[test]
fn epilogue_combines_quantization_scales() -> Result<()> {
    let problem = Problem::upsample_64().scales(2.0, 0.5, 1.0);
    let epilogue = epilogue_scalars(&problem.diff, &problem.filter, &problem.grad)?;
    assert_eq!(epilogue.alpha, 1.0);
    assert_eq!((epilogue.beta, epilogue.gamma, epilogue.delta), (0.0, 0.0, 0.0));

    let mut plain = Problem::upsample_64();
    plain.grad.dtype = DType::Int8;
    assert!(epilogue_scalars(&plain.diff, &plain.filter, &plain.grad).is_err());
    Ok(())
}

#[test]
fn problem_size_swaps_roles_of_diff_and_grad() -> Result<()> {
    let problem = Problem::new(2, 12, 10, 8, 16, (3, 5), (2, 2), (1, 2));
    let size = problem_size(&problem.size_args()?)?;
    assert_eq!((size.n, size.h, size.w, size.c), (2, 12, 10, 8));
    assert_eq!((size.k, size.r, size.s), (16, 3, 5));
    assert_eq!((size.p, size.q), (6, 5));
    assert_eq!((size.pad_h, size.pad_w, size.stride_h, size.stride_w), (1, 2, 2, 2));
    assert_eq!((size.dilation_h, size.dilation_w), (1, 1));
    assert_eq!(size.mode, ConvMode::CrossCorrelation);
    Ok(())
}

#[test]
fn repacked_filter_reads_back_through_kernel_addressing() -> Result<()> {
    let backend = CpuBackend::new();
    let mut rng = StdRng::seed_from_u64(7);
    for interleaved in [4usize, 8, 16] {
        let shape = FilterReorder {
            oc: 32,
            ic: 12,
            fh: 3,
            fw: 2,
            interleaved,
        };
        let values = random_i8(&mut rng, shape.elements());
        let src = HostBuffer::from_slice(&values);
        let dst = HostBuffer::zeroed(shape.elements());
        backend.reorder_filter_nhwc_to_cnxhwx(&dst, &src, &shape)?;
        let packed = dst.to_vec();

        let mut sorted_src = values.clone();
        let mut sorted_dst = packed.clone();
        sorted_src.sort_unstable();
        sorted_dst.sort_unstable();
        assert_eq!(sorted_src, sorted_dst);

        for oc in 0..shape.oc {
            for fh in 0..shape.fh {
                for fw in 0..shape.fw {
                    for ic in 0..shape.ic {
                        assert_eq!(
                            packed[shape.cnxhwx_offset(oc, fh, fw, ic)],
                            values[shape.ohwi_offset(oc, fh, fw, ic)],
                            "x={interleaved} oc={oc} fh={fh} fw={fw} ic={ic}"
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn run_and_compare(policy: AlgoPolicy, stride: (usize, usize)) -> Result<String> {
    let backend = Arc::new(CpuBackend::new());
    let library = reference_library();
    let problem = Problem::new(2, 6, 7, 8, 16, (3, 3), stride, (1, 1)).scales(0.5, 0.25, 2.0);
    let opr = ConvolutionBackwardData::with_policy(
        Arc::clone(&backend),
        library,
        problem.param,
        policy,
    );

    let mut rng = StdRng::seed_from_u64(42);
    let diff_values = random_i8(&mut rng, problem.diff.total_elements());
    let filter_values = random_i8(&mut rng, problem.filter.total_elements());
    let diff = HostBuffer::from_slice(&diff_values);
    let filter = HostBuffer::from_slice(&filter_values);
    let grad = HostBuffer::zeroed(problem.grad.dense_bytes());

    let ws_size = opr.get_workspace_in_bytes(&problem.filter, &problem.diff, &problem.grad)?;
    assert_eq!(ws_size, problem.filter.dense_bytes());
    let workspace = HostBuffer::zeroed(ws_size);

    let args = opr.deduce_size_args(&problem.filter, &problem.diff, &problem.grad)?;
    let chosen = opr.get_algorithm_heuristic(&args, ws_size)?.name().to_string();

    opr.exec(
        TensorNd::new(&problem.filter, &filter),
        TensorNd::new(&problem.diff, &diff),
        TensorNd::new(&problem.grad, &grad),
        &workspace,
    )?;

    let alpha = 0.5f32 * 0.25 / 2.0;
    let expected = naive_deconv(&problem, &diff_values, &filter_values, alpha);
    assert_eq!(grad.to_vec(), expected, "algorithm {chosen}");
    assert_eq!(backend.post_launch_calls(), 1);
    assert_eq!(backend.stream().launches(), 1);
    Ok(chosen)
}

#[test]
fn heuristic_execution_matches_naive_deconvolution() -> Result<()> {
    let chosen = run_and_compare(AlgoPolicy::default(), (2, 2))?;
    assert_eq!(chosen, "INT8_NHWC_IMMA_IMPLICIT_GEMM_64X16X32_64X16X32_2stage_4");
    run_and_compare(AlgoPolicy::default(), (1, 1))?;
    run_and_compare(AlgoPolicy::default(), (1, 2))?;
    Ok(())
}

#[test]
fn forced_algorithm_is_used_when_available() -> Result<()> {
    let name = "INT8_NHWC_IMMA_IMPLICIT_GEMM_128X32X32_64X32X32_1stage_16";
    let chosen = run_and_compare(
        AlgoPolicy::Force {
            algorithm: name.to_string(),
        },
        (2, 2),
    )?;
    assert_eq!(chosen, name);
    Ok(())
}

#[test]
fn unavailable_forced_algorithm_falls_back_to_heuristic() -> Result<()> {
    let library = reference_library();
    let backend = Arc::new(CpuBackend::new());
    // 12 output channels rule out access sizes 8 and 16.
    let problem = Problem::new(1, 8, 8, 8, 12, (3, 3), (1, 1), (1, 1));
    let opr = ConvolutionBackwardData::with_policy(
        backend,
        library,
        problem.param,
        AlgoPolicy::Force {
            algorithm: "INT8_NHWC_IMMA_IMPLICIT_GEMM_64X16X32_64X16X32_2stage_16".into(),
        },
    );
    let args = problem.size_args()?;
    let algo = opr.get_algorithm_heuristic(&args, usize::MAX)?;
    assert_eq!(
        algo.name(),
        "INT8_NHWC_IMMA_IMPLICIT_GEMM_64X16X32_64X16X32_2stage_4"
    );
    Ok(())
}

#[test]
fn heuristic_choice_is_cached_per_problem() -> Result<()> {
    let opr = ConvolutionBackwardData::with_policy(
        Arc::new(CpuBackend::new()),
        reference_library(),
        ConvolutionParam::nhwc().with_stride(2, 2).with_padding(1, 1),
        AlgoPolicy::Heuristic { cache_size: 4 },
    );
    let problem = Problem::upsample_64();
    let args = opr.deduce_size_args(&problem.filter, &problem.diff, &problem.grad)?;
    let first = opr.get_algorithm_heuristic(&args, usize::MAX)?.name().to_string();
    assert_eq!(opr.cached_choices(), 1);
    let second = opr.get_algorithm_heuristic(&args, usize::MAX)?.name().to_string();
    assert_eq!(first, second);
    assert_eq!(opr.cached_choices(), 1);

    let uncached = ConvolutionBackwardData::with_policy(
        Arc::new(CpuBackend::new()),
        reference_library(),
        *opr.param(),
        AlgoPolicy::Heuristic { cache_size: 0 },
    );
    uncached.get_algorithm_heuristic(&args, usize::MAX)?;
    assert_eq!(uncached.cached_choices(), 0);
    Ok(())
}

#[test]
fn no_available_algorithm_is_an_error() -> Result<()> {
    let opr = ConvolutionBackwardData::with_policy(
        Arc::new(CpuBackend::with_compute_capability(ComputeCapability::new(6, 1))),
        reference_library(),
        ConvolutionParam::nhwc().with_stride(2, 2).with_padding(1, 1),
        AlgoPolicy::default(),
    );
    let problem = Problem::upsample_64();
    let err = opr
        .get_workspace_in_bytes(&problem.filter, &problem.diff, &problem.grad)
        .unwrap_err();
    assert!(matches!(err, BackendError::Unimplemented { .. }));

    let available = ConvolutionBackwardData::with_policy(
        Arc::new(CpuBackend::new()),
        reference_library(),
        *opr.param(),
        AlgoPolicy::default(),
    );
    let args = problem.size_args()?;
    assert!(available.get_algorithm_heuristic(&args, 1024).is_err());
    assert_eq!(available.all_algorithms().len(), 6);
    assert!(available
        .all_algorithms()
        .iter()
        .all(|algo| algo.is_reproducible()));
    assert!(available
        .algorithm_by_name("INT8_NHWC_IMMA_IMPLICIT_GEMM_64X16X32_64X16X32_2stage_8")
        .is_some());
    assert!(available.algorithm_by_name("CUDNN").is_none());
    Ok(())
}

#[test]
fn inconsistent_shapes_are_rejected() {
    let problem = Problem::upsample_64();
    let bad_diff = TensorLayout::contiguous([1, 15, 16, 64], qs8(1.0));
    assert!(SizeArgs::new(&problem.param, &problem.filter, &bad_diff, &problem.grad).is_err());

    let bad_channels = TensorLayout::contiguous([1, 16, 16, 32], qs8(1.0));
    assert!(
        SizeArgs::new(&problem.param, &problem.filter, &bad_channels, &problem.grad).is_err()
    );

    let bad_batch = TensorLayout::contiguous([2, 16, 16, 64], qs8(1.0));
    assert!(SizeArgs::new(&problem.param, &problem.filter, &bad_batch, &problem.grad).is_err());

    let flat = TensorLayout::contiguous([64, 9, 64], qs8(1.0));
    assert!(SizeArgs::new(&problem.param, &flat, &problem.diff, &problem.grad).is_err());
}

#[test]
fn short_workspace_is_rejected_before_launch() -> Result<()> {
    let backend = CpuBackend::new();
    let library = reference_library();
    let problem = Problem::new(1, 8, 8, 8, 16, (3, 3), (2, 2), (1, 1));
    let args = problem.size_args()?;
    let algo = imma_algo(&library, 8);
    let filter = HostBuffer::zeroed(problem.filter.dense_bytes());
    let diff = HostBuffer::zeroed(problem.diff.dense_bytes());
    let grad = HostBuffer::zeroed(problem.grad.dense_bytes());
    let workspace = HostBuffer::zeroed(algo.workspace_in_bytes(&args) - 1);
    let exec_args = ExecArgs::<CpuBackend>::new(&args, &filter, &diff, &grad, &workspace)?;
    let err = algo.exec(&backend, &exec_args).unwrap_err();
    assert!(matches!(err, BackendError::InvalidArgument { .. }));
    assert_eq!(backend.stream().launches(), 0);

    let short_grad = HostBuffer::zeroed(problem.grad.dense_bytes() - 1);
    assert!(ExecArgs::<CpuBackend>::new(&args, &filter, &diff, &short_grad, &workspace).is_err());
    Ok(())
}

struct FailingLaunch;

impl CpuKernelInterceptor for FailingLaunch {
    fn try_execute(&self, _kernel: &OperationDescription) -> Option<Status> {
        Some(Status::ErrorInternal)
    }
}

#[test]
fn launch_failure_propagates_without_post_launch_hook() -> Result<()> {
    let backend = Arc::new(CpuBackend::with_interceptor(
        CpuBackend::DEFAULT_CAPABILITY,
        Arc::new(FailingLaunch),
    ));
    let problem = Problem::new(1, 8, 8, 8, 16, (3, 3), (2, 2), (1, 1));
    let opr = ConvolutionBackwardData::with_policy(
        Arc::clone(&backend),
        reference_library(),
        problem.param,
        AlgoPolicy::default(),
    );
    let filter = HostBuffer::zeroed(problem.filter.dense_bytes());
    let diff = HostBuffer::zeroed(problem.diff.dense_bytes());
    let grad = HostBuffer::zeroed(problem.grad.dense_bytes());
    let workspace = HostBuffer::zeroed(problem.filter.dense_bytes());

    let err = opr
        .exec(
            TensorNd::new(&problem.filter, &filter),
            TensorNd::new(&problem.diff, &diff),
            TensorNd::new(&problem.grad, &grad),
            &workspace,
        )
        .unwrap_err();
    match err {
        BackendError::KernelLaunch { kernel, status } => {
            assert_eq!(status, Status::ErrorInternal);
            assert!(kernel.starts_with("host_s8_dgrad_nhwc_CK4RS4"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.post_launch_calls(), 0);
    assert_eq!(backend.stream().launches(), 0);
    Ok(())
}

#[test]
fn saturated_inputs_wrap_the_i32_accumulator() -> Result<()> {
    // 3x3 taps over 14576 channels at -128 * -128: the centre pixel sums 131184 products and
    // exceeds i32::MAX, edge and corner pixels stay in range.
    let co = 14576;
    let problem = Problem::new(1, 3, 3, 4, co, (3, 3), (1, 1), (1, 1));
    let backend = Arc::new(CpuBackend::new());
    let opr = ConvolutionBackwardData::with_policy(
        Arc::clone(&backend),
        reference_library(),
        problem.param,
        AlgoPolicy::default(),
    );
    let filter = HostBuffer::from_vec(vec![-128; problem.filter.dense_bytes()]);
    let diff = HostBuffer::from_vec(vec![-128; problem.diff.dense_bytes()]);
    let grad = HostBuffer::zeroed(problem.grad.dense_bytes());
    let workspace = HostBuffer::zeroed(problem.filter.dense_bytes());
    opr.exec(
        TensorNd::new(&problem.filter, &filter),
        TensorNd::new(&problem.diff, &diff),
        TensorNd::new(&problem.grad, &grad),
        &workspace,
    )?;

    let wrapped = |taps: i64| (taps * co as i64 * 128 * 128) as i32;
    assert!(wrapped(9) < 0);
    assert!(wrapped(6) > 0);
    let grad = grad.to_vec();
    for ih in 0..3 {
        for iw in 0..3 {
            let taps = [2, 3, 2][ih] * [2, 3, 2][iw];
            let expected = if wrapped(taps) < 0 { -128 } else { 127 };
            for ic in 0..4 {
                assert_eq!(grad[(ih * 3 + iw) * 4 + ic], expected, "pixel ({ih}, {iw})");
            }
        }
    }
    assert_eq!(backend.post_launch_calls(), 1);
    Ok(())
}
