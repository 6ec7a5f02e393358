use crate::backend::spec::{BackendError, BackendResult, DType, TensorLayout};
use crate::layout::Format;

use super::param::{ConvolutionParam, Mode, Sparse};

/// Filter description normalized across formats and sparse modes.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonizedFilterMeta {
    pub dtype: DType,
    pub format: Format,
    pub should_flip: bool,
    pub group: usize,
    /// Input channels per group.
    pub icpg: usize,
    /// Output channels per group.
    pub ocpg: usize,
    pub spatial_ndim: usize,
    pub spatial: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    /// `(spatial - 1) * dilation + 1` per axis.
    pub dilated_spatial: [usize; 2],
}

impl CanonizedFilterMeta {
    /// Normalizes `filter` under `param`.
    ///
    /// Dense filters are `OIHW` for NCHW and `OHWI` for NHWC; group filters carry an extra
    /// leading group axis.
    pub fn new(param: &ConvolutionParam, filter: &TensorLayout) -> BackendResult<Self> {
        let grouped = matches!(param.sparse, Sparse::Group);
        let expected_ndim = if grouped { 5 } else { 4 };
        if filter.ndim() != expected_ndim {
            return Err(BackendError::invalid_argument(format!(
                "{:?} filter must have {expected_ndim} dims, got {}",
                param.sparse, filter
            )));
        }
        let (group, dims) = if grouped {
            (filter.dim(0), &filter.shape[1..])
        } else {
            (1, &filter.shape[..])
        };

        let (ocpg, icpg, fh, fw) = match param.format {
            Format::NCHW => (dims[0], dims[1], dims[2], dims[3]),
            Format::NHWC => (dims[0], dims[3], dims[1], dims[2]),
            other => {
                return Err(BackendError::unimplemented(
                    "convolution filter meta",
                    format!("format {other:?} is not supported"),
                ))
            }
        };

        if param.stride_h == 0 || param.stride_w == 0 {
            return Err(BackendError::invalid_argument("convolution stride must be positive"));
        }
        if param.dilate_h == 0 || param.dilate_w == 0 {
            return Err(BackendError::invalid_argument(
                "convolution dilation must be positive",
            ));
        }
        if group == 0 || ocpg == 0 || icpg == 0 || fh == 0 || fw == 0 {
            return Err(BackendError::invalid_argument(format!(
                "filter has an empty axis: {filter}"
            )));
        }

        let spatial = [fh, fw];
        let dilation = [param.dilate_h, param.dilate_w];
        Ok(Self {
            dtype: filter.dtype,
            format: param.format,
            should_flip: matches!(param.mode, Mode::Convolution),
            group,
            icpg,
            ocpg,
            spatial_ndim: 2,
            spatial,
            stride: [param.stride_h, param.stride_w],
            padding: [param.pad_h, param.pad_w],
            dilation,
            dilated_spatial: [
                (spatial[0] - 1) * dilation[0] + 1,
                (spatial[1] - 1) * dilation[1] + 1,
            ],
        })
    }

    pub fn filter_area(&self) -> usize {
        self.spatial[0] * self.spatial[1]
    }

    /// Output extent of the forward convolution along spatial axis `axis`.
    pub fn forward_output_extent(&self, input: usize, axis: usize) -> Option<usize> {
        let padded = input + 2 * self.padding[axis];
        let window = self.dilated_spatial[axis];
        if padded < window {
            return None;
        }
        Some((padded - window) / self.stride[axis] + 1)
    }
}
