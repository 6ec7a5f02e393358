pub mod backend;
pub mod conv;
pub mod env;
pub mod graph;
pub mod layout;
pub mod library;

pub use backend::device::{BufferRegion, ComputeBackend, ComputeCapability, TensorNd};
pub use backend::spec::{BackendError, BackendResult, DType, TensorLayout};
pub use conv::backward_data::{
    AlgoInt8NhwcImmaImplicitGemm, AlgoParam, AlgoPolicy, BackwardDataAlgorithm,
    ConvolutionBackwardData, DeconvInt8Helper, ExecArgs, SizeArgs,
};
pub use conv::ConvolutionParam;
pub use layout::Format;
pub use library::KernelLibrary;
