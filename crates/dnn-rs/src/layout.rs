//! Tensor format tags.
//!
//! Operators describe activations with a small set of canonical formats. This module defines the
//! shared format enum and the axis helpers operators need, without introducing wrapper tensor
//! types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Format {
    NCHW,
    NHWC,
    NCHW4,
    NCHW32,
}

impl Format {
    /// Axis holding the channel dimension of an activation tensor.
    pub const fn channel_axis(self) -> usize {
        match self {
            Format::NCHW | Format::NCHW4 | Format::NCHW32 => 1,
            Format::NHWC => 3,
        }
    }

    /// Axes holding the (height, width) dimensions of an activation tensor.
    pub const fn spatial_axes(self) -> [usize; 2] {
        match self {
            Format::NCHW | Format::NCHW4 | Format::NCHW32 => [2, 3],
            Format::NHWC => [1, 2],
        }
    }
}
