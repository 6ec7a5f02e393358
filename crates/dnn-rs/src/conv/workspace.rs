use crate::backend::device::BufferRegion;
use crate::backend::spec::{BackendError, BackendResult};

/// Partition of one caller-provided workspace into aligned sub-regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBundle {
    sizes: Vec<usize>,
    align: usize,
}

impl WorkspaceBundle {
    /// `align` must be a power of two; an alignment of 1 packs regions back to back.
    pub fn new(sizes: impl Into<Vec<usize>>, align: usize) -> Self {
        assert!(align.is_power_of_two(), "workspace alignment must be a power of two");
        Self {
            sizes: sizes.into(),
            align,
        }
    }

    fn aligned(&self, bytes: usize) -> usize {
        (bytes + self.align - 1) & !(self.align - 1)
    }

    pub fn offset(&self, index: usize) -> usize {
        self.sizes[..index]
            .iter()
            .map(|&bytes| self.aligned(bytes))
            .sum()
    }

    pub fn total_size_in_bytes(&self) -> usize {
        self.offset(self.sizes.len())
    }

    /// Returns the view of region `index` inside `workspace`.
    pub fn region<R: BufferRegion>(&self, workspace: &R, index: usize) -> BackendResult<R> {
        if index >= self.sizes.len() {
            return Err(BackendError::invalid_argument(format!(
                "workspace region {index} out of range ({} regions)",
                self.sizes.len()
            )));
        }
        if workspace.byte_len() < self.total_size_in_bytes() {
            return Err(BackendError::invalid_argument(format!(
                "workspace of {} bytes is smaller than the required {} bytes",
                workspace.byte_len(),
                self.total_size_in_bytes()
            )));
        }
        workspace.sub_region(self.offset(index), self.sizes[index])
    }
}
