//! Convolution backward-data (transposed convolution).
//!
//! Given the gradient `diff` of a convolution's output and its `filter`, produces the gradient
//! `grad` of the convolution's input. The operator owns a pack of algorithms, validates the
//! problem, picks an algorithm according to an [`AlgoPolicy`] and runs it on the backend.

pub mod catalog;
pub mod deconv_helper;
pub mod int8_nhwc_imma;
pub mod policy;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::backend::device::{BufferRegion, ComputeBackend, TensorNd};
use crate::backend::hashing::FingerprintHasher;
use crate::backend::spec::{BackendError, BackendResult, TensorLayout};
use crate::env;
use crate::library::KernelLibrary;

use super::filter_meta::CanonizedFilterMeta;
use super::param::ConvolutionParam;

pub use catalog::{AlgoParam, INT8_NHWC_IMMA_ALGO_PARAMS};
pub use deconv_helper::{DeconvInt8Helper, FilterReorder};
pub use int8_nhwc_imma::AlgoInt8NhwcImmaImplicitGemm;
pub use policy::{AlgoPolicy, AlgoPolicySetting};

/// Validated description of one backward-data problem.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeArgs {
    pub param: ConvolutionParam,
    pub filter_meta: CanonizedFilterMeta,
    pub filter_layout: TensorLayout,
    /// Gradient of the convolution output; the kernel's source operand.
    pub diff_layout: TensorLayout,
    /// Gradient of the convolution input; the kernel's destination operand.
    pub grad_layout: TensorLayout,
}

impl SizeArgs {
    /// Checks that `diff` is the forward output shape of `grad` convolved with `filter`.
    pub fn new(
        param: &ConvolutionParam,
        filter: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> BackendResult<Self> {
        let filter_meta = CanonizedFilterMeta::new(param, filter)?;
        for (what, layout) in [("filter", filter), ("diff", diff), ("grad", grad)] {
            if layout.shape.len() != layout.strides.len() {
                return Err(BackendError::invalid_argument(format!(
                    "{what} layout has mismatched shape and strides: {layout}"
                )));
            }
        }
        if diff.ndim() != 4 || grad.ndim() != 4 {
            return Err(BackendError::invalid_argument(format!(
                "diff and grad must be 4D, got diff {diff} and grad {grad}"
            )));
        }

        let channel = param.format.channel_axis();
        let spatial = param.format.spatial_axes();
        if diff.dim(0) != grad.dim(0) {
            return Err(BackendError::invalid_argument(format!(
                "batch mismatch: diff {} vs grad {}",
                diff.dim(0),
                grad.dim(0)
            )));
        }
        let group = filter_meta.group;
        if diff.dim(channel) != group * filter_meta.ocpg {
            return Err(BackendError::invalid_argument(format!(
                "diff has {} channels, filter produces {}",
                diff.dim(channel),
                group * filter_meta.ocpg
            )));
        }
        if grad.dim(channel) != group * filter_meta.icpg {
            return Err(BackendError::invalid_argument(format!(
                "grad has {} channels, filter consumes {}",
                grad.dim(channel),
                group * filter_meta.icpg
            )));
        }
        for (axis, &dim) in spatial.iter().enumerate() {
            let expected = filter_meta.forward_output_extent(grad.dim(dim), axis);
            if expected != Some(diff.dim(dim)) {
                return Err(BackendError::invalid_argument(format!(
                    "diff extent {} on axis {dim} does not match grad extent {} (expected {:?})",
                    diff.dim(dim),
                    grad.dim(dim),
                    expected
                )));
            }
        }

        Ok(Self {
            param: *param,
            filter_meta,
            filter_layout: filter.clone(),
            diff_layout: diff.clone(),
            grad_layout: grad.clone(),
        })
    }

    /// Stable hash of everything an algorithm's availability depends on.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FingerprintHasher::new();
        hasher.write(&self.param);
        for layout in [&self.filter_layout, &self.diff_layout, &self.grad_layout] {
            hasher.write(&layout.shape);
            hasher.write(&layout.strides);
            hasher.write(&layout.dtype.enumv());
            hasher.write_f32(layout.dtype.scale().unwrap_or(0.0));
        }
        hasher.finish()
    }
}

/// Operands of one execution: the problem plus the memory of every tensor.
pub struct ExecArgs<'a, B: ComputeBackend> {
    pub size: &'a SizeArgs,
    pub filter: &'a B::Buffer,
    pub diff: &'a B::Buffer,
    pub grad: &'a B::Buffer,
    pub workspace: &'a B::Buffer,
}

impl<'a, B: ComputeBackend> ExecArgs<'a, B> {
    /// Checks every buffer against the layout it is meant to hold.
    pub fn new(
        size: &'a SizeArgs,
        filter: &'a B::Buffer,
        diff: &'a B::Buffer,
        grad: &'a B::Buffer,
        workspace: &'a B::Buffer,
    ) -> BackendResult<Self> {
        TensorNd::new(&size.filter_layout, filter).check_capacity("filter")?;
        TensorNd::new(&size.diff_layout, diff).check_capacity("diff")?;
        TensorNd::new(&size.grad_layout, grad).check_capacity("grad")?;
        Ok(Self {
            size,
            filter,
            diff,
            grad,
            workspace,
        })
    }
}

/// One way of computing backward-data on backend `B`.
pub trait BackwardDataAlgorithm<B: ComputeBackend>: Send + Sync {
    /// Unique, stable identifier.
    fn name(&self) -> &str;

    /// Repeated runs on the same inputs produce bit-identical results.
    fn is_reproducible(&self) -> bool {
        true
    }

    /// Pure applicability check; never fails.
    fn is_available(&self, backend: &B, args: &SizeArgs) -> bool;

    fn workspace_in_bytes(&self, args: &SizeArgs) -> usize;

    fn exec(&self, backend: &B, args: &ExecArgs<'_, B>) -> BackendResult<()>;

    /// Available and needing no more than `workspace_limit` bytes of workspace.
    fn is_available_wk(&self, backend: &B, args: &SizeArgs, workspace_limit: usize) -> bool {
        self.is_available(backend, args) && self.workspace_in_bytes(args) <= workspace_limit
    }
}

/// Every backward-data algorithm of a backend, in priority order.
pub struct AlgoPack<B: DeconvInt8Helper> {
    pub int8_nhwc_imma: Vec<AlgoInt8NhwcImmaImplicitGemm<B>>,
}

impl<B: DeconvInt8Helper> AlgoPack<B> {
    pub fn new(library: Arc<KernelLibrary<B>>) -> Self {
        let int8_nhwc_imma = INT8_NHWC_IMMA_ALGO_PARAMS
            .iter()
            .map(|&param| AlgoInt8NhwcImmaImplicitGemm::new(param, Arc::clone(&library)))
            .collect();
        Self { int8_nhwc_imma }
    }

    pub fn all(&self) -> Vec<&dyn BackwardDataAlgorithm<B>> {
        self.int8_nhwc_imma
            .iter()
            .map(|algo| algo as &dyn BackwardDataAlgorithm<B>)
            .collect()
    }
}

type HeuristicCache = LruCache<(u64, usize), usize>;

/// Backward-data operator bound to one backend handle.
pub struct ConvolutionBackwardData<B: DeconvInt8Helper> {
    backend: Arc<B>,
    param: ConvolutionParam,
    algos: AlgoPack<B>,
    policy: AlgoPolicy,
    heuristic_cache: Mutex<Option<HeuristicCache>>,
}

impl<B: DeconvInt8Helper> ConvolutionBackwardData<B> {
    /// Builds the operator with the policy configured in the environment.
    pub fn new(backend: Arc<B>, library: Arc<KernelLibrary<B>>, param: ConvolutionParam) -> Self {
        let mut policy = env::conv_bwd_data_policy().unwrap_or_default();
        if !env::algo_cache_enabled() {
            policy = policy.without_cache();
        }
        Self::with_policy(backend, library, param, policy)
    }

    pub fn with_policy(
        backend: Arc<B>,
        library: Arc<KernelLibrary<B>>,
        param: ConvolutionParam,
        policy: AlgoPolicy,
    ) -> Self {
        let heuristic_cache = NonZeroUsize::new(policy.cache_size()).map(LruCache::new);
        Self {
            backend,
            param,
            algos: AlgoPack::new(library),
            policy,
            heuristic_cache: Mutex::new(heuristic_cache),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn param(&self) -> &ConvolutionParam {
        &self.param
    }

    pub fn policy(&self) -> &AlgoPolicy {
        &self.policy
    }

    pub fn deduce_size_args(
        &self,
        filter: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> BackendResult<SizeArgs> {
        SizeArgs::new(&self.param, filter, diff, grad)
    }

    pub fn all_algorithms(&self) -> Vec<&dyn BackwardDataAlgorithm<B>> {
        self.algos.all()
    }

    pub fn algorithm_by_name(&self, name: &str) -> Option<&dyn BackwardDataAlgorithm<B>> {
        self.algos.all().into_iter().find(|algo| algo.name() == name)
    }

    /// Picks an algorithm for `args` that fits in `workspace_limit` bytes.
    pub fn get_algorithm_heuristic(
        &self,
        args: &SizeArgs,
        workspace_limit: usize,
    ) -> BackendResult<&dyn BackwardDataAlgorithm<B>> {
        let backend = self.backend.as_ref();
        if let AlgoPolicy::Force { algorithm } = &self.policy {
            match self.algorithm_by_name(algorithm) {
                Some(algo) if algo.is_available_wk(backend, args, workspace_limit) => {
                    debug!(algo = algo.name(), "using forced backward-data algorithm");
                    return Ok(algo);
                }
                Some(_) => debug!(
                    algo = %algorithm,
                    "forced backward-data algorithm unavailable, falling back to heuristic"
                ),
                None => debug!(
                    algo = %algorithm,
                    "forced backward-data algorithm unknown, falling back to heuristic"
                ),
            }
        }

        let algos = self.algos.all();
        let cache_key = (args.fingerprint(), workspace_limit);
        if let Some(index) = self.lookup_cache(&cache_key) {
            if let Some(&algo) = algos.get(index) {
                if algo.is_available_wk(backend, args, workspace_limit) {
                    return Ok(algo);
                }
            }
            self.remove_cache_entry(&cache_key);
        }

        let (index, algo) = algos
            .iter()
            .enumerate()
            .find(|(_, algo)| algo.is_available_wk(backend, args, workspace_limit))
            .ok_or_else(|| {
                BackendError::unimplemented(
                    "convolution backward data",
                    format!(
                        "no algorithm available for filter {} diff {} grad {} within {} workspace bytes on {}",
                        args.filter_layout,
                        args.diff_layout,
                        args.grad_layout,
                        workspace_limit,
                        backend.backend_name()
                    ),
                )
            })?;
        debug!(
            algo = algo.name(),
            reproducible = algo.is_reproducible(),
            "selected backward-data algorithm"
        );
        self.update_cache(cache_key, index);
        Ok(*algo)
    }

    pub fn get_workspace_in_bytes(
        &self,
        filter: &TensorLayout,
        diff: &TensorLayout,
        grad: &TensorLayout,
    ) -> BackendResult<usize> {
        let args = self.deduce_size_args(filter, diff, grad)?;
        let algo = self.get_algorithm_heuristic(&args, usize::MAX)?;
        Ok(algo.workspace_in_bytes(&args))
    }

    /// Computes `grad` from `filter` and `diff`, using `workspace` as scratch memory.
    pub fn exec(
        &self,
        filter: TensorNd<'_, B::Buffer>,
        diff: TensorNd<'_, B::Buffer>,
        grad: TensorNd<'_, B::Buffer>,
        workspace: &B::Buffer,
    ) -> BackendResult<()> {
        let args = self.deduce_size_args(filter.layout, diff.layout, grad.layout)?;
        let algo = self.get_algorithm_heuristic(&args, workspace.byte_len())?;
        let exec_args = ExecArgs::new(&args, filter.region, diff.region, grad.region, workspace)?;
        algo.exec(self.backend.as_ref(), &exec_args)
    }

    fn lookup_cache(&self, key: &(u64, usize)) -> Option<usize> {
        let mut guard = self
            .heuristic_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().and_then(|cache| cache.get(key).copied())
    }

    fn remove_cache_entry(&self, key: &(u64, usize)) {
        let mut guard = self
            .heuristic_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = guard.as_mut() {
            cache.pop(key);
        }
    }

    fn update_cache(&self, key: (u64, usize), index: usize) {
        let mut guard = self
            .heuristic_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = guard.as_mut() {
            cache.put(key, index);
        }
    }

    /// Number of problems whose algorithm choice is currently cached.
    pub fn cached_choices(&self) -> usize {
        self.heuristic_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, LruCache::len)
    }
}
