//! Filter repacking for the int8 dgrad kernels.
//!
//! The kernels read the filter as `C (N/x) H W x`: input channel outermost, then output channels
//! in groups of `x` with the group members interleaved innermost. The source is the dense `OHWI`
//! filter of an NHWC convolution.

use crate::backend::device::ComputeBackend;
use crate::backend::spec::{BackendError, BackendResult};

/// Dimensions of a dense `OHWI` filter to repack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterReorder {
    pub oc: usize,
    pub ic: usize,
    pub fh: usize,
    pub fw: usize,
    /// Output-channel interleave factor `x`.
    pub interleaved: usize,
}

impl FilterReorder {
    pub fn elements(&self) -> usize {
        self.oc * self.ic * self.fh * self.fw
    }

    pub fn validate(&self) -> BackendResult<()> {
        if self.interleaved == 0 || self.oc % self.interleaved != 0 {
            return Err(BackendError::invalid_argument(format!(
                "output channels {} are not a multiple of the interleave factor {}",
                self.oc, self.interleaved
            )));
        }
        Ok(())
    }

    /// Index of `(oc, fh, fw, ic)` in the source `OHWI` filter.
    pub fn ohwi_offset(&self, oc: usize, fh: usize, fw: usize, ic: usize) -> usize {
        ((oc * self.fh + fh) * self.fw + fw) * self.ic + ic
    }

    /// Index of `(oc, fh, fw, ic)` in the repacked `CNxHWx` filter.
    pub fn cnxhwx_offset(&self, oc: usize, fh: usize, fw: usize, ic: usize) -> usize {
        let x = self.interleaved;
        let area = self.fh * self.fw;
        ic * (self.oc * area) + (oc / x) * (area * x) + (fh * self.fw + fw) * x + oc % x
    }
}

/// Repacks a dense `OHWI` filter into `CNxHWx` on the host.
pub fn reorder_filter_nhwc_to_cnxhwx_host(
    dst: &mut [i8],
    src: &[i8],
    shape: &FilterReorder,
) -> BackendResult<()> {
    shape.validate()?;
    let elements = shape.elements();
    if src.len() < elements || dst.len() < elements {
        return Err(BackendError::invalid_argument(format!(
            "filter reorder needs {elements} elements, got src {} and dst {}",
            src.len(),
            dst.len()
        )));
    }
    for oc in 0..shape.oc {
        for fh in 0..shape.fh {
            for fw in 0..shape.fw {
                let row = shape.ohwi_offset(oc, fh, fw, 0);
                for ic in 0..shape.ic {
                    dst[shape.cnxhwx_offset(oc, fh, fw, ic)] = src[row + ic];
                }
            }
        }
    }
    Ok(())
}

/// Backends that can repack int8 filters on their own stream.
pub trait DeconvInt8Helper: ComputeBackend {
    /// Enqueues the `OHWI -> CNxHWx` repack of `src` into `dst`.
    fn reorder_filter_nhwc_to_cnxhwx(
        &self,
        dst: &Self::Buffer,
        src: &Self::Buffer,
        shape: &FilterReorder,
    ) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaves_output_channels_innermost() {
        let shape = FilterReorder {
            oc: 8,
            ic: 4,
            fh: 1,
            fw: 2,
            interleaved: 4,
        };
        let src: Vec<i8> = (0..shape.elements() as i32).map(|v| v as i8).collect();
        let mut dst = vec![0i8; shape.elements()];
        reorder_filter_nhwc_to_cnxhwx_host(&mut dst, &src, &shape).unwrap();

        // ic = 0, first group of four output channels at fw = 0 then fw = 1.
        let expected_head: Vec<i8> = [(0, 0), (1, 0), (2, 0), (3, 0), (0, 1), (1, 1), (2, 1), (3, 1)]
            .iter()
            .map(|&(oc, fw)| src[shape.ohwi_offset(oc, 0, fw, 0)])
            .collect();
        assert_eq!(&dst[..8], expected_head.as_slice());
        assert_eq!(dst[shape.cnxhwx_offset(5, 0, 1, 3)], src[shape.ohwi_offset(5, 0, 1, 3)]);
    }

    #[test]
    fn repack_is_a_permutation() {
        let shape = FilterReorder {
            oc: 16,
            ic: 8,
            fh: 3,
            fw: 3,
            interleaved: 16,
        };
        let mut seen = vec![false; shape.elements()];
        for oc in 0..shape.oc {
            for fh in 0..shape.fh {
                for fw in 0..shape.fw {
                    for ic in 0..shape.ic {
                        let offset = shape.cnxhwx_offset(oc, fh, fw, ic);
                        assert!(!seen[offset]);
                        seen[offset] = true;
                    }
                }
            }
        }
        assert!(seen.into_iter().all(|hit| hit));
    }

    #[test]
    fn rejects_unaligned_output_channels() {
        let shape = FilterReorder {
            oc: 12,
            ic: 4,
            fh: 1,
            fw: 1,
            interleaved: 8,
        };
        let src = vec![0i8; shape.elements()];
        let mut dst = vec![0i8; shape.elements()];
        assert!(reorder_filter_nhwc_to_cnxhwx_host(&mut dst, &src, &shape).is_err());
    }
}
