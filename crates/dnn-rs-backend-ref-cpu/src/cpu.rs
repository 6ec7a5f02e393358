use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dnn_rs::backend::device::{check_sub_region, BufferRegion, ComputeBackend, ComputeCapability};
use dnn_rs::backend::spec::{BackendError, BackendResult};
use dnn_rs::conv::backward_data::deconv_helper::{
    reorder_filter_nhwc_to_cnxhwx_host, DeconvInt8Helper, FilterReorder,
};
use dnn_rs::library::{OperationDescription, Status};
use tracing::trace;

/// View over shared host memory.
#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<RwLock<Vec<i8>>>,
    offset: usize,
    len: usize,
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<i8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(RwLock::new(data)),
            offset: 0,
            len,
        }
    }

    pub fn from_slice(data: &[i8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Copies the viewed bytes out.
    pub fn to_vec(&self) -> Vec<i8> {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        guard[self.offset..self.offset + self.len].to_vec()
    }

    /// Overwrites the start of the view with `values`.
    pub fn write(&self, values: &[i8]) -> BackendResult<()> {
        check_sub_region(self.len, 0, values.len())?;
        self.with_mut(|dst| {
            dst[..values.len()].copy_from_slice(values);
            Ok(())
        })
    }

    /// Runs `f` on the viewed bytes under the write lock.
    ///
    /// `f` must not touch any other view of the same allocation.
    pub fn with_mut<T>(&self, f: impl FnOnce(&mut [i8]) -> BackendResult<T>) -> BackendResult<T> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard[self.offset..self.offset + self.len])
    }

    pub fn shares_allocation(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl BufferRegion for HostBuffer {
    fn byte_len(&self) -> usize {
        self.len
    }

    fn sub_region(&self, offset: usize, bytes: usize) -> BackendResult<Self> {
        check_sub_region(self.len, offset, bytes)?;
        Ok(Self {
            data: Arc::clone(&self.data),
            offset: self.offset + offset,
            len: bytes,
        })
    }
}

/// Lets tests observe or fail kernel launches before they execute.
pub trait CpuKernelInterceptor: Send + Sync {
    /// Returns the status to report instead of running the kernel, or `None` to run it.
    fn try_execute(&self, kernel: &OperationDescription) -> Option<Status>;
}

#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(&self, _kernel: &OperationDescription) -> Option<Status> {
        None
    }
}

/// In-order host "stream": kernels run synchronously at launch.
pub struct HostStream {
    interceptor: Arc<dyn CpuKernelInterceptor>,
    launches: AtomicUsize,
}

impl HostStream {
    fn new(interceptor: Arc<dyn CpuKernelInterceptor>) -> Self {
        Self {
            interceptor,
            launches: AtomicUsize::new(0),
        }
    }

    /// Gives the interceptor a chance to replace the launch; counts launches that proceed.
    pub fn begin_launch(&self, kernel: &OperationDescription) -> Option<Status> {
        if let Some(status) = self.interceptor.try_execute(kernel) {
            trace!(kernel = %kernel.name, %status, "launch intercepted");
            return Some(status);
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Kernels executed on this stream.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }
}

/// Host backend standing in for a device of a configurable compute capability.
pub struct CpuBackend {
    capability: ComputeCapability,
    stream: HostStream,
    post_launch_calls: AtomicUsize,
}

impl CpuBackend {
    /// Turing-class capability, the minimum for the int8 tensor-core kernels.
    pub const DEFAULT_CAPABILITY: ComputeCapability = ComputeCapability::new(7, 5);

    pub fn new() -> Self {
        Self::with_interceptor(Self::DEFAULT_CAPABILITY, Arc::new(NoopInterceptor))
    }

    pub fn with_compute_capability(capability: ComputeCapability) -> Self {
        Self::with_interceptor(capability, Arc::new(NoopInterceptor))
    }

    pub fn with_interceptor(
        capability: ComputeCapability,
        interceptor: Arc<dyn CpuKernelInterceptor>,
    ) -> Self {
        Self {
            capability,
            stream: HostStream::new(interceptor),
            post_launch_calls: AtomicUsize::new(0),
        }
    }

    /// Times the post-launch hook has run.
    pub fn post_launch_calls(&self) -> usize {
        self.post_launch_calls.load(Ordering::Relaxed)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    type Buffer = HostBuffer;
    type Stream = HostStream;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn stream(&self) -> &HostStream {
        &self.stream
    }

    fn compute_capability(&self) -> ComputeCapability {
        self.capability
    }

    fn after_kernel_launch(&self) -> BackendResult<()> {
        self.post_launch_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl DeconvInt8Helper for CpuBackend {
    fn reorder_filter_nhwc_to_cnxhwx(
        &self,
        dst: &HostBuffer,
        src: &HostBuffer,
        shape: &FilterReorder,
    ) -> BackendResult<()> {
        if dst.byte_len() < shape.elements() {
            return Err(BackendError::invalid_argument(format!(
                "reorder destination holds {} bytes, needs {}",
                dst.byte_len(),
                shape.elements()
            )));
        }
        // Copy first: src and dst may be views of one allocation.
        let src = src.to_vec();
        dst.with_mut(|dst| reorder_filter_nhwc_to_cnxhwx_host(dst, &src, shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_regions_share_storage() {
        let buffer = HostBuffer::from_vec((0..16).collect());
        let tail = buffer.sub_region(8, 8).unwrap();
        assert_eq!(tail.to_vec(), (8..16).collect::<Vec<i8>>());
        tail.write(&[-1, -2]).unwrap();
        assert_eq!(&buffer.to_vec()[8..10], &[-1, -2]);
        assert!(tail.shares_allocation(&buffer));
        assert!(tail.sub_region(4, 8).is_err());
    }

    #[test]
    fn post_launch_hook_is_counted() {
        let backend = CpuBackend::new();
        backend.after_kernel_launch().unwrap();
        assert_eq!(backend.post_launch_calls(), 1);
        assert!(backend.is_compute_capability_required(7, 5));
        assert!(!CpuBackend::with_compute_capability(ComputeCapability::new(7, 0))
            .is_compute_capability_required(7, 5));
    }
}
