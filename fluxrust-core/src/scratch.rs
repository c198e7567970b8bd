use std::sync::{Mutex, MutexGuard};

use crate::storage::Span;

/// Grow-only span table backing batched multi-buffer operations.
///
/// Each context owns exactly one pool, and a context's kernels execute in
/// submission order, so consecutive batched operations may reuse the same
/// table: a kernel loads its descriptors, runs, and the next kernel
/// overwrites them. Capacity only ever grows, to the largest batch seen so
/// far, for the lifetime of the context.
#[derive(Debug, Default)]
pub(crate) struct ScratchPool {
    parts: Mutex<Vec<Span>>,
}

impl ScratchPool {
    pub(crate) fn new() -> Self {
        ScratchPool {
            parts: Mutex::new(Vec::new()),
        }
    }

    /// Loads `parts` into the pooled table and hands it to the caller.
    /// Called from inside an enqueued kernel only.
    pub(crate) fn load(&self, parts: &[Span]) -> MutexGuard<'_, Vec<Span>> {
        let mut table = self.parts.lock().expect("scratch pool poisoned");
        table.clear();
        table.extend_from_slice(parts);
        table
    }
}
