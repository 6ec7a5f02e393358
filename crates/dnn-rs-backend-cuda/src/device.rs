//! Minimal CUDA driver binding, resolved at runtime.
//!
//! Only the calls the dgrad path needs are bound: one context on device 0, linear allocations,
//! blocking copies, streams, module loading and kernel launch.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use dnn_rs::backend::spec::{BackendError, BackendResult};
use dnn_rs::ComputeCapability;
use libloading::Library;
use tracing::debug;

type CUresult = i32;
type CUdevice = i32;
type CUdeviceptr = u64;
type RawPtr = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const ATTR_CC_MAJOR: i32 = 75;
const ATTR_CC_MINOR: i32 = 76;
// Blocking stream: synchronous copies on the legacy default stream order with its kernels.
const STREAM_FLAGS: u32 = 0;

const DRIVER_LIBRARIES: &[&str] = if cfg!(windows) {
    &["nvcuda.dll"]
} else if cfg!(target_os = "macos") {
    &["libcuda.dylib"]
} else {
    &["libcuda.so.1", "libcuda.so"]
};

macro_rules! driver_api {
    ($($field:ident = $symbol:literal: fn($($arg:ty),* $(,)?);)*) => {
        struct DriverApi {
            $($field: unsafe extern "C" fn($($arg),*) -> CUresult,)*
        }

        impl DriverApi {
            fn resolve(lib: &Library) -> BackendResult<Self> {
                Ok(Self {
                    $($field: resolve(lib, concat!($symbol, "\0"))?,)*
                })
            }
        }
    };
}

driver_api! {
    init = "cuInit": fn(u32);
    device_get = "cuDeviceGet": fn(*mut CUdevice, i32);
    device_attribute = "cuDeviceGetAttribute": fn(*mut i32, i32, CUdevice);
    ctx_create = "cuCtxCreate_v2": fn(*mut RawPtr, u32, CUdevice);
    ctx_destroy = "cuCtxDestroy_v2": fn(RawPtr);
    ctx_set_current = "cuCtxSetCurrent": fn(RawPtr);
    mem_alloc = "cuMemAlloc_v2": fn(*mut CUdeviceptr, usize);
    mem_free = "cuMemFree_v2": fn(CUdeviceptr);
    memcpy_htod = "cuMemcpyHtoD_v2": fn(CUdeviceptr, *const c_void, usize);
    memcpy_dtoh = "cuMemcpyDtoH_v2": fn(*mut c_void, CUdeviceptr, usize);
    memset_d8 = "cuMemsetD8_v2": fn(CUdeviceptr, u8, usize);
    stream_create = "cuStreamCreate": fn(*mut RawPtr, u32);
    stream_destroy = "cuStreamDestroy_v2": fn(RawPtr);
    stream_synchronize = "cuStreamSynchronize": fn(RawPtr);
    module_load = "cuModuleLoadData": fn(*mut RawPtr, *const c_void);
    module_unload = "cuModuleUnload": fn(RawPtr);
    module_function = "cuModuleGetFunction": fn(*mut RawPtr, RawPtr, *const c_char);
    launch = "cuLaunchKernel": fn(
        RawPtr, u32, u32, u32, u32, u32, u32, u32, RawPtr, *mut *mut c_void, *mut *mut c_void,
    );
    error_name = "cuGetErrorName": fn(CUresult, *mut *const c_char);
}

fn resolve<T: Copy>(lib: &Library, symbol: &'static str) -> BackendResult<T> {
    // SAFETY: every symbol is declared above with its driver API signature.
    unsafe { lib.get::<T>(symbol.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|err| {
            BackendError::execution(format!(
                "CUDA driver lacks {}: {err}",
                symbol.trim_end_matches('\0')
            ))
        })
}

/// Opaque driver handle (context, stream, module or function).
#[derive(Clone, Copy)]
struct Handle(RawPtr);

// SAFETY: driver handles are process-wide identifiers, usable from any thread once the owning
// context is made current.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    const NULL: Handle = Handle(std::ptr::null_mut());
}

/// Loaded driver with a context on device 0.
pub struct CudaDriver {
    api: DriverApi,
    context: Handle,
    capability: ComputeCapability,
    _lib: Library,
}

static DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, initialized on first use.
pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let loaded = DRIVER.get_or_init(|| {
        CudaDriver::open()
            .map(Arc::new)
            .map_err(|err| err.to_string())
    });
    loaded
        .as_ref()
        .map(Arc::clone)
        .map_err(|msg| BackendError::execution(format!("CUDA driver unavailable: {msg}")))
}

impl CudaDriver {
    fn open() -> BackendResult<Self> {
        let lib = DRIVER_LIBRARIES
            .iter()
            // SAFETY: loading the vendor driver runs only its own initializers.
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| {
                BackendError::execution(format!(
                    "no CUDA driver library found (tried {})",
                    DRIVER_LIBRARIES.join(", ")
                ))
            })?;
        let api = DriverApi::resolve(&lib)?;

        let mut device: CUdevice = 0;
        let mut major = 0i32;
        let mut minor = 0i32;
        let mut context = Handle::NULL;
        // SAFETY: all out-pointers are valid locals.
        unsafe {
            check(&api, (api.init)(0), "cuInit")?;
            check(&api, (api.device_get)(&mut device, 0), "cuDeviceGet")?;
            check(
                &api,
                (api.device_attribute)(&mut major, ATTR_CC_MAJOR, device),
                "cuDeviceGetAttribute",
            )?;
            check(
                &api,
                (api.device_attribute)(&mut minor, ATTR_CC_MINOR, device),
                "cuDeviceGetAttribute",
            )?;
            check(&api, (api.ctx_create)(&mut context.0, 0, device), "cuCtxCreate")?;
        }
        let capability = ComputeCapability::new(major.max(0) as u32, minor.max(0) as u32);
        debug!(%capability, "CUDA context created on device 0");
        Ok(Self {
            api,
            context,
            capability,
            _lib: lib,
        })
    }

    pub fn compute_capability(&self) -> ComputeCapability {
        self.capability
    }

    /// Makes this driver's context current on the calling thread.
    fn bind(&self) -> BackendResult<()> {
        // SAFETY: the context lives until the driver drops.
        self.check(
            unsafe { (self.api.ctx_set_current)(self.context.0) },
            "cuCtxSetCurrent",
        )
    }

    fn check(&self, code: CUresult, call: &'static str) -> BackendResult<()> {
        check(&self.api, code, call)
    }

    pub fn create_stream(self: &Arc<Self>) -> BackendResult<CudaStream> {
        self.bind()?;
        let mut handle = Handle::NULL;
        // SAFETY: out-pointer is a valid local.
        self.check(
            unsafe { (self.api.stream_create)(&mut handle.0, STREAM_FLAGS) },
            "cuStreamCreate",
        )?;
        Ok(CudaStream {
            driver: Arc::clone(self),
            handle,
        })
    }

    /// Allocates `bytes` of device memory initialized from `fill`.
    pub fn allocate(self: &Arc<Self>, bytes: usize, fill: Fill<'_>) -> BackendResult<DeviceBuffer> {
        self.bind()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: out-pointer is a valid local; zero-byte requests allocate one byte.
        self.check(
            unsafe { (self.api.mem_alloc)(&mut ptr, bytes.max(1)) },
            "cuMemAlloc",
        )?;
        let buffer = DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        };
        match fill {
            Fill::Zero if bytes > 0 => {
                // SAFETY: `ptr` addresses `bytes` freshly allocated bytes.
                self.check(
                    unsafe { (self.api.memset_d8)(ptr, 0, bytes) },
                    "cuMemsetD8",
                )?;
            }
            Fill::Zero => {}
            Fill::Host(data) => self.copy_to_device(ptr, &data[..bytes.min(data.len())])?,
        }
        Ok(buffer)
    }

    /// Blocking host-to-device copy into `dst`.
    pub fn copy_to_device(&self, dst: CUdeviceptr, data: &[u8]) -> BackendResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.bind()?;
        // SAFETY: caller guarantees `dst` addresses at least `data.len()` bytes.
        self.check(
            unsafe { (self.api.memcpy_htod)(dst, data.as_ptr().cast(), data.len()) },
            "cuMemcpyHtoD",
        )
    }

    /// Blocking device-to-host copy of `len` bytes from `src`.
    pub fn copy_to_host(&self, src: CUdeviceptr, len: usize) -> BackendResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        if len > 0 {
            self.bind()?;
            // SAFETY: `out` holds `len` writable bytes; caller guarantees `src` is readable.
            self.check(
                unsafe { (self.api.memcpy_dtoh)(out.as_mut_ptr().cast(), src, len) },
                "cuMemcpyDtoH",
            )?;
        }
        Ok(out)
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        // SAFETY: the context is owned here and destroyed exactly once.
        let _ = unsafe { (self.api.ctx_destroy)(self.context.0) };
    }
}

fn check(api: &DriverApi, code: CUresult, call: &'static str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        return Ok(());
    }
    let mut name: *const c_char = std::ptr::null();
    // SAFETY: on success the driver points `name` at a static NUL-terminated string.
    let known = unsafe { (api.error_name)(code, &mut name) } == CUDA_SUCCESS && !name.is_null();
    let name = if known {
        // SAFETY: checked non-null above; the string is static.
        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    } else {
        "unknown error".to_string()
    };
    Err(BackendError::execution(format!(
        "{call} failed: {name} ({code})"
    )))
}

/// Initial contents of a new allocation.
pub enum Fill<'a> {
    Zero,
    Host(&'a [u8]),
}

/// Device allocation, freed when dropped.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer({:#x}, {} bytes)", self.ptr, self.bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: the allocation belongs to this buffer and is freed exactly once.
        let _ = unsafe { (self.driver.api.mem_free)(self.ptr) };
    }
}

/// Grid, block and dynamic shared memory of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

/// In-order work queue on the driver's context.
pub struct CudaStream {
    driver: Arc<CudaDriver>,
    handle: Handle,
}

impl CudaStream {
    /// Enqueues `function`; `params` holds one pointer per kernel parameter.
    pub fn launch(
        &self,
        function: &CudaFunction,
        config: &LaunchConfig,
        params: &mut [*mut c_void],
    ) -> BackendResult<()> {
        self.driver.bind()?;
        let (grid, block) = (config.grid, config.block);
        // SAFETY: function and stream share this context; `params` matches the kernel signature.
        let code = unsafe {
            (self.driver.api.launch)(
                function.handle.0,
                grid.0,
                grid.1,
                grid.2,
                block.0,
                block.1,
                block.2,
                config.shared_mem_bytes,
                self.handle.0,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        self.driver.check(code, "cuLaunchKernel")
    }

    /// Blocks until all enqueued work has finished.
    pub fn synchronize(&self) -> BackendResult<()> {
        self.driver.bind()?;
        // SAFETY: the stream is alive until drop.
        let code = unsafe { (self.driver.api.stream_synchronize)(self.handle.0) };
        self.driver.check(code, "cuStreamSynchronize")
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: the stream is owned here and destroyed exactly once.
        let _ = unsafe { (self.driver.api.stream_destroy)(self.handle.0) };
    }
}

/// Loaded PTX or cubin image.
pub struct CudaModule {
    driver: Arc<CudaDriver>,
    handle: Handle,
}

impl CudaModule {
    pub fn load(driver: &Arc<CudaDriver>, image: &[u8]) -> BackendResult<Arc<Self>> {
        // PTX is read as a C string; cubin ignores the trailing byte.
        let mut image = image.to_vec();
        if image.last() != Some(&0) {
            image.push(0);
        }
        driver.bind()?;
        let mut handle = Handle::NULL;
        // SAFETY: `image` outlives the call; out-pointer is a valid local.
        driver.check(
            unsafe { (driver.api.module_load)(&mut handle.0, image.as_ptr().cast()) },
            "cuModuleLoadData",
        )?;
        Ok(Arc::new(Self {
            driver: Arc::clone(driver),
            handle,
        }))
    }

    pub fn function(self: &Arc<Self>, symbol: &str) -> BackendResult<CudaFunction> {
        let name = CString::new(symbol).map_err(|_| {
            BackendError::invalid_argument(format!("kernel symbol {symbol:?} contains NUL"))
        })?;
        self.driver.bind()?;
        let mut handle = Handle::NULL;
        // SAFETY: module is loaded; `name` is NUL-terminated.
        self.driver.check(
            unsafe { (self.driver.api.module_function)(&mut handle.0, self.handle.0, name.as_ptr()) },
            "cuModuleGetFunction",
        )?;
        Ok(CudaFunction {
            _module: Arc::clone(self),
            handle,
        })
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        // SAFETY: the module is owned here and unloaded exactly once.
        let _ = unsafe { (self.driver.api.module_unload)(self.handle.0) };
    }
}

/// Kernel entry point; keeps its module loaded.
#[derive(Clone)]
pub struct CudaFunction {
    _module: Arc<CudaModule>,
    handle: Handle,
}
