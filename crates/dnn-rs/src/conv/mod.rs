//! Convolution operators.

pub mod backward_data;
pub mod filter_meta;
pub mod param;
pub mod workspace;

pub use filter_meta::CanonizedFilterMeta;
pub use param::{ComputeMode, ConvolutionParam, Mode, Sparse};
pub use workspace::WorkspaceBundle;
