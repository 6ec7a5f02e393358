//! Precompiled implicit-GEMM dgrad kernels loaded through the CUDA driver.
//!
//! Kernel images are shipped out of tree. A JSON manifest lists each image together with the
//! [`ConvolutionKey`] it was compiled for; [`cuda_library`] registers every entry that loads.

use std::ffi::c_void;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dnn_rs::backend::spec::{BackendError, BackendResult};
use dnn_rs::library::{
    ConvMode, Conv2dProblemSize, ConvolutionArguments, ConvolutionKey, KernelLibrary, Operation,
    OperationDescription, OperationTable, Status,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::{self, CudaFunction, CudaModule, LaunchConfig};
use crate::{CudaBackend, CudaStream};

const WARP_SIZE: u32 = 32;

/// One manifest entry: a kernel image and the signature it implements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DgradKernelSpec {
    pub key: ConvolutionKey,
    /// PTX or cubin file, relative to the manifest directory.
    pub image: PathBuf,
    pub symbol: String,
    #[serde(default)]
    pub shared_mem_bytes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelManifest {
    #[serde(skip)]
    root: PathBuf,
    pub kernels: Vec<DgradKernelSpec>,
}

impl KernelManifest {
    pub fn new(root: impl Into<PathBuf>, kernels: Vec<DgradKernelSpec>) -> Self {
        Self {
            root: root.into(),
            kernels,
        }
    }

    /// Reads `path`; image paths resolve against its parent directory.
    pub fn load(path: &Path) -> BackendResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            BackendError::execution(format!(
                "failed to read kernel manifest {}: {err}",
                path.display()
            ))
        })?;
        let mut manifest: KernelManifest = serde_json::from_str(&text).map_err(|err| {
            BackendError::invalid_argument(format!(
                "malformed kernel manifest {}: {err}",
                path.display()
            ))
        })?;
        manifest.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    pub fn image_path(&self, spec: &DgradKernelSpec) -> PathBuf {
        self.root.join(&spec.image)
    }
}

/// Kernel argument block, passed by value as the kernel's only parameter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DgradKernelParams {
    n: i32,
    h: i32,
    w: i32,
    c: i32,
    k: i32,
    r: i32,
    s: i32,
    p: i32,
    q: i32,
    pad_h: i32,
    pad_w: i32,
    stride_h: i32,
    stride_w: i32,
    dilation_h: i32,
    dilation_w: i32,
    cross_correlation: i32,
    src: u64,
    filter: u64,
    bias: u64,
    z: u64,
    dst: u64,
    alpha: f32,
    beta: f32,
    gamma: f32,
    delta: f32,
}

/// A loaded dgrad kernel.
pub struct CudaConvOperation {
    description: OperationDescription,
    function: CudaFunction,
    shared_mem_bytes: u32,
}

impl CudaConvOperation {
    pub fn load(manifest: &KernelManifest, spec: &DgradKernelSpec) -> BackendResult<Self> {
        let path = manifest.image_path(spec);
        let image = fs::read(&path).map_err(|err| {
            BackendError::execution(format!(
                "failed to read kernel image {}: {err}",
                path.display()
            ))
        })?;
        let module = CudaModule::load(&device::driver()?, &image)?;
        let function = module.function(&spec.symbol)?;
        Ok(Self {
            description: OperationDescription {
                name: spec.symbol.clone(),
                key: spec.key,
            },
            function,
            shared_mem_bytes: spec.shared_mem_bytes,
        })
    }
}

/// Grid covers the implicit GEMM: `M = n*h*w` rows by `N = c` columns, one warp per warp tile.
fn launch_config(
    key: &ConvolutionKey,
    problem: &Conv2dProblemSize,
    shared_mem_bytes: u32,
) -> Option<LaunchConfig> {
    let tb = key.threadblock_shape;
    let warp = key.warp_shape;
    if tb.m == 0 || tb.n == 0 || warp.m == 0 || warp.n == 0 {
        return None;
    }
    let rows = u64::try_from(problem.n).ok()?
        * u64::try_from(problem.h).ok()?
        * u64::try_from(problem.w).ok()?;
    let cols = u64::try_from(problem.c).ok()?;
    let grid_x = u32::try_from(rows.div_ceil(u64::from(tb.m))).ok()?;
    let grid_y = u32::try_from(cols.div_ceil(u64::from(tb.n))).ok()?;
    if grid_x == 0 || grid_y == 0 {
        return None;
    }
    let warps = (tb.m / warp.m) * (tb.n / warp.n) * (tb.k / warp.k.max(1)).max(1);
    Some(LaunchConfig {
        grid: (grid_x, grid_y, 1),
        block: (WARP_SIZE * warps, 1, 1),
        shared_mem_bytes,
    })
}

fn ptr_of(buffer: Option<&crate::CudaBuffer>) -> u64 {
    buffer.map_or(0, crate::CudaBuffer::device_ptr)
}

impl Operation<CudaBackend> for CudaConvOperation {
    fn description(&self) -> &OperationDescription {
        &self.description
    }

    fn run(&self, args: &ConvolutionArguments<'_, CudaBackend>, stream: &CudaStream) -> Status {
        let problem = &args.problem_size;
        let Some(config) =
            launch_config(&self.description.key, problem, self.shared_mem_bytes)
        else {
            return Status::ErrorInvalidProblem;
        };
        let mut params = DgradKernelParams {
            n: problem.n,
            h: problem.h,
            w: problem.w,
            c: problem.c,
            k: problem.k,
            r: problem.r,
            s: problem.s,
            p: problem.p,
            q: problem.q,
            pad_h: problem.pad_h,
            pad_w: problem.pad_w,
            stride_h: problem.stride_h,
            stride_w: problem.stride_w,
            dilation_h: problem.dilation_h,
            dilation_w: problem.dilation_w,
            cross_correlation: i32::from(problem.mode == ConvMode::CrossCorrelation),
            src: args.src.device_ptr(),
            filter: args.filter.device_ptr(),
            bias: ptr_of(args.bias),
            z: ptr_of(args.z),
            dst: args.dst.device_ptr(),
            alpha: args.epilogue.alpha,
            beta: args.epilogue.beta,
            gamma: args.epilogue.gamma,
            delta: args.epilogue.delta,
        };
        let mut kernel_args = [&mut params as *mut DgradKernelParams as *mut c_void];
        match stream.launch(&self.function, &config, &mut kernel_args) {
            Ok(()) => Status::Success,
            Err(err) => {
                warn!(kernel = %self.description.name, "launch rejected by driver: {err}");
                Status::ErrorInternal
            }
        }
    }
}

fn register_manifest(manifest: &KernelManifest, table: &mut OperationTable<CudaBackend>) {
    for spec in &manifest.kernels {
        match CudaConvOperation::load(manifest, spec) {
            Ok(op) => {
                debug!(kernel = %spec.symbol, key = %spec.key, "registered dgrad kernel");
                table.append(Arc::new(op));
            }
            Err(err) => warn!(kernel = %spec.symbol, "skipping kernel: {err}"),
        }
    }
}

/// Library populated from `manifest` on first lookup.
pub fn cuda_library(manifest: KernelManifest) -> Arc<KernelLibrary<CudaBackend>> {
    Arc::new(KernelLibrary::lazy(move |table| {
        register_manifest(&manifest, table)
    }))
}
