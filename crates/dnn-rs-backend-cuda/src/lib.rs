mod device;
pub mod kernels;

use std::fmt;
use std::sync::Arc;

use dnn_rs::backend::device::{check_sub_region, BufferRegion, ComputeBackend, ComputeCapability};
use dnn_rs::backend::spec::{BackendError, BackendResult};
use dnn_rs::conv::backward_data::deconv_helper::{
    reorder_filter_nhwc_to_cnxhwx_host, DeconvInt8Helper, FilterReorder,
};
use dnn_rs::KernelLibrary;
use tracing::{debug, info};

pub use device::{CudaDriver, CudaStream, DeviceBuffer, Fill, LaunchConfig};
pub use kernels::{cuda_library, CudaConvOperation, DgradKernelSpec, KernelManifest};

/// View over a device allocation.
#[derive(Clone)]
pub struct CudaBuffer {
    buffer: Arc<DeviceBuffer>,
    offset: usize,
    len: usize,
}

impl CudaBuffer {
    pub fn zeroed(len: usize) -> BackendResult<Self> {
        let buffer = device::driver()?.allocate(len, Fill::Zero)?;
        Ok(Self::whole(Arc::new(buffer)))
    }

    pub fn from_host(data: &[i8]) -> BackendResult<Self> {
        let buffer = device::driver()?.allocate(data.len(), Fill::Host(as_bytes(data)))?;
        Ok(Self::whole(Arc::new(buffer)))
    }

    fn whole(buffer: Arc<DeviceBuffer>) -> Self {
        let len = buffer.bytes();
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    /// Address of the first viewed byte.
    pub fn device_ptr(&self) -> u64 {
        self.buffer.device_ptr() + self.offset as u64
    }

    /// Blocking copy of the viewed bytes to the host.
    pub fn read_to_vec(&self) -> BackendResult<Vec<i8>> {
        let bytes = self.buffer.driver().copy_to_host(self.device_ptr(), self.len)?;
        Ok(bytes.into_iter().map(|b| b as i8).collect())
    }

    /// Overwrites the start of the view with `values`.
    pub fn write(&self, values: &[i8]) -> BackendResult<()> {
        check_sub_region(self.len, 0, values.len())?;
        self.buffer
            .driver()
            .copy_to_device(self.device_ptr(), as_bytes(values))
    }
}

fn as_bytes(data: &[i8]) -> &[u8] {
    // SAFETY: i8 and u8 share size and alignment; every bit pattern is valid for both.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len()) }
}

impl fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBuffer")
            .field("ptr", &self.device_ptr())
            .field("len", &self.len)
            .finish()
    }
}

impl BufferRegion for CudaBuffer {
    fn byte_len(&self) -> usize {
        self.len
    }

    fn sub_region(&self, offset: usize, bytes: usize) -> BackendResult<Self> {
        check_sub_region(self.len, offset, bytes)?;
        Ok(Self {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + offset,
            len: bytes,
        })
    }
}

/// CUDA driver backend: one context, one stream.
pub struct CudaBackend {
    driver: Arc<CudaDriver>,
    stream: CudaStream,
    sync_after_launch: bool,
}

impl CudaBackend {
    pub fn new() -> BackendResult<Self> {
        let driver = device::driver()?;
        let stream = driver.create_stream()?;
        let sync_after_launch = dnn_rs::env::cuda_sync_launch();
        info!(
            capability = %driver.compute_capability(),
            sync_after_launch,
            "cuda backend ready"
        );
        Ok(Self {
            driver,
            stream,
            sync_after_launch,
        })
    }

    pub fn is_available() -> bool {
        device::is_available()
    }

    /// Library described by `DNNRS_CUDA_KERNEL_MANIFEST`, or an empty one when unset.
    pub fn default_library() -> BackendResult<Arc<KernelLibrary<CudaBackend>>> {
        match dnn_rs::env::cuda_kernel_manifest() {
            Some(path) => Ok(cuda_library(KernelManifest::load(&path)?)),
            None => {
                debug!("no cuda kernel manifest configured");
                Ok(Arc::new(KernelLibrary::empty()))
            }
        }
    }

    pub fn synchronize(&self) -> BackendResult<()> {
        self.stream.synchronize()
    }
}

impl ComputeBackend for CudaBackend {
    type Buffer = CudaBuffer;
    type Stream = CudaStream;

    fn backend_name(&self) -> &str {
        "cuda"
    }

    fn stream(&self) -> &CudaStream {
        &self.stream
    }

    fn compute_capability(&self) -> ComputeCapability {
        self.driver.compute_capability()
    }

    fn after_kernel_launch(&self) -> BackendResult<()> {
        if self.sync_after_launch {
            self.stream.synchronize()?;
        }
        Ok(())
    }
}

impl DeconvInt8Helper for CudaBackend {
    /// Staged through host memory; the filter is small next to the activations.
    fn reorder_filter_nhwc_to_cnxhwx(
        &self,
        dst: &CudaBuffer,
        src: &CudaBuffer,
        shape: &FilterReorder,
    ) -> BackendResult<()> {
        if dst.byte_len() < shape.elements() {
            return Err(BackendError::invalid_argument(format!(
                "reorder destination holds {} bytes, needs {}",
                dst.byte_len(),
                shape.elements()
            )));
        }
        // Earlier work on the stream may still be producing the filter.
        self.stream.synchronize()?;
        let host_src = src.read_to_vec()?;
        let mut host_dst = vec![0i8; shape.elements()];
        reorder_filter_nhwc_to_cnxhwx_host(&mut host_dst, &host_src, shape)?;
        dst.write(&host_dst)
    }
}
