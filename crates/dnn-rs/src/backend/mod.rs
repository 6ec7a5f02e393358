pub mod device;
pub mod hashing;
pub mod spec;

pub use device::{BufferRegion, ComputeBackend, ComputeCapability, TensorNd};
pub use spec::{BackendError, BackendResult, DType, DTypeEnum, TensorLayout};
