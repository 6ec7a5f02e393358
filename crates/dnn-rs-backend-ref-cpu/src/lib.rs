pub mod cpu;
pub mod dgrad;

pub use cpu::{CpuBackend, CpuKernelInterceptor, HostBuffer, HostStream, NoopInterceptor};
pub use dgrad::{reference_library, register_reference_dgrad_kernels, HostDgradOperation};
