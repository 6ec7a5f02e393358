//! Device-facing contracts consumed by the kernel algorithms.
//!
//! The algorithms never allocate or free tensor memory. Callers hand in [`BufferRegion`] views over
//! memory they own, and the backend supplies the ordered execution stream, the compute capability
//! of the device and the post-launch bookkeeping hook.

use std::fmt;

use super::spec::{BackendError, BackendResult, TensorLayout};

/// GPU architecture generation, e.g. `7.5` for Turing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns `true` when this device is at least `major.minor`.
    pub fn satisfies(self, major: u32, minor: u32) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm_{}{}", self.major, self.minor)
    }
}

/// Length-carrying view over caller-owned memory.
///
/// Views are cheap handles; cloning one never copies the underlying bytes.
pub trait BufferRegion: Clone + Send + Sync + fmt::Debug {
    fn byte_len(&self) -> usize;

    /// Returns the sub-view `[offset, offset + bytes)`.
    fn sub_region(&self, offset: usize, bytes: usize) -> BackendResult<Self>;
}

/// Checks that `[offset, offset + bytes)` lies within a region of `len` bytes.
pub fn check_sub_region(len: usize, offset: usize, bytes: usize) -> BackendResult<()> {
    match offset.checked_add(bytes) {
        Some(end) if end <= len => Ok(()),
        _ => Err(BackendError::invalid_argument(format!(
            "sub-region [{offset}, {offset}+{bytes}) exceeds buffer of {len} bytes"
        ))),
    }
}

/// A tensor as seen by an operator: its layout plus the memory holding it.
#[derive(Debug)]
pub struct TensorNd<'a, R> {
    pub layout: &'a TensorLayout,
    pub region: &'a R,
}

impl<'a, R: BufferRegion> TensorNd<'a, R> {
    pub fn new(layout: &'a TensorLayout, region: &'a R) -> Self {
        Self { layout, region }
    }

    /// Fails when the region cannot hold every element the layout addresses.
    pub fn check_capacity(&self, what: &str) -> BackendResult<()> {
        let needed = self.layout.span_bytes();
        if self.region.byte_len() < needed {
            return Err(BackendError::invalid_argument(format!(
                "{what} buffer holds {} bytes but layout {} needs {needed}",
                self.region.byte_len(),
                self.layout
            )));
        }
        Ok(())
    }
}

/// Device handle used by kernel algorithms.
pub trait ComputeBackend: Send + Sync + 'static {
    type Buffer: BufferRegion;
    type Stream: Send + Sync;

    /// Returns a human-readable backend identifier (e.g., "cpu", "cuda").
    fn backend_name(&self) -> &str;

    /// Ordered command stream all work of this handle is enqueued on.
    fn stream(&self) -> &Self::Stream;

    fn compute_capability(&self) -> ComputeCapability;

    /// Returns `true` when the device is at least `major.minor`.
    fn is_compute_capability_required(&self, major: u32, minor: u32) -> bool {
        self.compute_capability().satisfies(major, minor)
    }

    /// Called once after every successful kernel launch.
    fn after_kernel_launch(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_ordering_follows_generations() {
        let turing = ComputeCapability::new(7, 5);
        assert!(turing.satisfies(7, 5));
        assert!(!turing.satisfies(8, 0));
        assert!(ComputeCapability::new(8, 0).satisfies(7, 5));
        assert!(!ComputeCapability::new(7, 0).satisfies(7, 5));
        assert!(!ComputeCapability::new(6, 1).satisfies(7, 5));
        assert_eq!(turing.to_string(), "sm_75");
    }

    #[test]
    fn sub_region_bounds() {
        assert!(check_sub_region(16, 0, 16).is_ok());
        assert!(check_sub_region(16, 8, 8).is_ok());
        assert!(check_sub_region(16, 8, 9).is_err());
        assert!(check_sub_region(16, usize::MAX, 2).is_err());
    }
}
