use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::backend::device::ComputeBackend;

use super::{ConvolutionKey, Operation};

/// Exact-match index from kernel signature to compiled operation.
pub struct OperationTable<B: ComputeBackend> {
    conv2d_operations: HashMap<ConvolutionKey, Arc<dyn Operation<B>>>,
}

impl<B: ComputeBackend> OperationTable<B> {
    pub fn new() -> Self {
        Self {
            conv2d_operations: HashMap::new(),
        }
    }

    /// Registers an operation under the key of its description.
    ///
    /// A later registration with the same key replaces the earlier one.
    pub fn append(&mut self, operation: Arc<dyn Operation<B>>) {
        let key = operation.description().key;
        if let Some(previous) = self.conv2d_operations.insert(key, operation) {
            debug!(
                replaced = %previous.description().name,
                "kernel library entry replaced for {key}"
            );
        }
    }

    pub fn find_op(&self, key: &ConvolutionKey) -> Option<Arc<dyn Operation<B>>> {
        self.conv2d_operations.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.conv2d_operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conv2d_operations.is_empty()
    }
}

impl<B: ComputeBackend> Default for OperationTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

type TableInitializer<B> = Box<dyn Fn(&mut OperationTable<B>) + Send + Sync>;

/// Kernel library shared by every algorithm instance of a backend.
///
/// Population runs exactly once, either eagerly at construction or on the first lookup; the
/// `OnceLock` barrier makes it happen-before every lookup. The library is passed to algorithms
/// explicitly instead of living in a global.
pub struct KernelLibrary<B: ComputeBackend> {
    table: OnceLock<OperationTable<B>>,
    initializer: Option<TableInitializer<B>>,
}

impl<B: ComputeBackend> KernelLibrary<B> {
    /// Wraps an already populated table.
    pub fn from_table(table: OperationTable<B>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(table);
        Self {
            table: cell,
            initializer: None,
        }
    }

    /// Defers population to the first lookup.
    pub fn lazy<F>(initializer: F) -> Self
    where
        F: Fn(&mut OperationTable<B>) + Send + Sync + 'static,
    {
        Self {
            table: OnceLock::new(),
            initializer: Some(Box::new(initializer)),
        }
    }

    /// Library without any kernels; every lookup misses.
    pub fn empty() -> Self {
        Self::from_table(OperationTable::new())
    }

    pub fn operation_table(&self) -> &OperationTable<B> {
        self.table.get_or_init(|| {
            let mut table = OperationTable::new();
            if let Some(initializer) = &self.initializer {
                initializer(&mut table);
            }
            info!(operations = table.len(), "kernel library initialized");
            table
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.table.get().is_some()
    }

    pub fn find_op(&self, key: &ConvolutionKey) -> Option<Arc<dyn Operation<B>>> {
        self.operation_table().find_op(key)
    }
}

impl<B: ComputeBackend> fmt::Debug for KernelLibrary<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLibrary")
            .field("initialized", &self.is_initialized())
            .field("operations", &self.table.get().map(OperationTable::len))
            .finish()
    }
}
