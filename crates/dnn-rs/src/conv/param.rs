use serde::{Deserialize, Serialize};

use crate::layout::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Cross-correlation, the deep-learning convention: the filter is not flipped.
    CrossCorrelation,
    /// Mathematical convolution: the filter is flipped spatially.
    Convolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sparse {
    Dense,
    /// The filter carries a leading group axis.
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeMode {
    Default,
    Float32,
}

/// Attributes of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionParam {
    pub mode: Mode,
    pub sparse: Sparse,
    pub format: Format,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
    pub compute_mode: ComputeMode,
}

impl Default for ConvolutionParam {
    fn default() -> Self {
        Self {
            mode: Mode::CrossCorrelation,
            sparse: Sparse::Dense,
            format: Format::NCHW,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilate_h: 1,
            dilate_w: 1,
            compute_mode: ComputeMode::Default,
        }
    }
}

impl ConvolutionParam {
    pub fn nhwc() -> Self {
        Self {
            format: Format::NHWC,
            ..Self::default()
        }
    }

    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilate_h: usize, dilate_w: usize) -> Self {
        self.dilate_h = dilate_h;
        self.dilate_w = dilate_w;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sparse(mut self, sparse: Sparse) -> Self {
        self.sparse = sparse;
        self
    }
}
