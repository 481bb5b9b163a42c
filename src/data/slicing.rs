// In: src/data/slicing.rs

//! The slice planner.
//!
//! Turns a pattern and a dataset shape into the canonical global ordering of slice
//! index tuples, then cuts that ordering into one contiguous run per worker. The
//! ordering is computed without communication and is identical on every worker,
//! so chunks written by different workers land in reproducible positions.

use std::ops::Range;

use crate::data::pattern::Pattern;
use crate::error::{PipelineError, Result};

/// One index per slice axis, in the pattern's slice-axis order.
pub type SliceIndex = Vec<usize>;

/// The canonical ordering of a pattern's slice positions and its partition across
/// workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    order: Vec<SliceIndex>,
    runs: Vec<Range<usize>>,
    padding: usize,
}

/// Computes the slice plan of `shape` under `pattern` for `worker_count` workers.
///
/// The order enumerates the Cartesian product of the slice-axis ranges with the
/// first declared slice axis varying slowest. A pattern with no slice axes yields a
/// single empty index (the whole array is one chunk).
pub fn plan(shape: &[usize], pattern: &Pattern, worker_count: usize) -> Result<SlicePlan> {
    if worker_count == 0 {
        return Err(PipelineError::Partition(
            "cannot partition a slice plan across zero workers".to_string(),
        ));
    }
    if shape.len() != pattern.ndim() {
        return Err(PipelineError::Partition(format!(
            "pattern '{}' covers {} axes, shape {:?} has {}",
            pattern.name(),
            pattern.ndim(),
            shape,
            shape.len()
        )));
    }

    let extents: Vec<usize> = pattern.slice_axes().iter().map(|&axis| shape[axis]).collect();
    let order = enumerate_row_major(&extents);
    let runs = partition(order.len(), worker_count);

    Ok(SlicePlan {
        order,
        runs,
        padding: 0,
    })
}

/// Row-major enumeration of every index tuple within `extents`.
fn enumerate_row_major(extents: &[usize]) -> Vec<SliceIndex> {
    let total: usize = extents.iter().product();
    let mut order = Vec::with_capacity(total);
    if total == 0 {
        return order;
    }

    let mut current = vec![0usize; extents.len()];
    for _ in 0..total {
        order.push(current.clone());
        // Odometer increment, last axis fastest.
        for axis in (0..extents.len()).rev() {
            current[axis] += 1;
            if current[axis] < extents[axis] {
                break;
            }
            current[axis] = 0;
        }
    }
    order
}

/// Splits `len` positions into `workers` contiguous runs; the first `len % workers`
/// runs are one longer than the rest.
fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let base = len / workers;
    let extra = len % workers;
    let mut runs = Vec::with_capacity(workers);
    let mut start = 0;
    for worker in 0..workers {
        let run_len = base + usize::from(worker < extra);
        runs.push(start..start + run_len);
        start += run_len;
    }
    runs
}

impl SlicePlan {
    /// Number of slice positions in the global ordering.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.runs.len()
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// The full canonical ordering.
    pub fn global_order(&self) -> &[SliceIndex] {
        &self.order
    }

    /// The slice index at a global position.
    pub fn index(&self, position: usize) -> &SliceIndex {
        &self.order[position]
    }

    /// Global positions owned by `worker`. Out-of-range workers own nothing.
    pub fn worker_range(&self, worker: usize) -> Range<usize> {
        self.runs.get(worker).cloned().unwrap_or(0..0)
    }

    /// Slice indices owned by `worker`.
    pub fn run(&self, worker: usize) -> &[SliceIndex] {
        &self.order[self.worker_range(worker)]
    }

    /// Returns the same plan with every worker's boundaries extended by up to
    /// `width` positions into its neighbours' runs. `with_padding(0)` restores the
    /// unpadded plan.
    pub fn with_padding(&self, width: usize) -> SlicePlan {
        SlicePlan {
            order: self.order.clone(),
            runs: self.runs.clone(),
            padding: width,
        }
    }

    /// The positions `worker` must be able to read: its own run widened by the
    /// padding and clamped to the global sequence. Empty runs stay empty.
    pub fn padded_range(&self, worker: usize) -> Range<usize> {
        let run = self.worker_range(worker);
        if run.is_empty() {
            return run;
        }
        run.start.saturating_sub(self.padding)..(run.end + self.padding).min(self.len())
    }

    /// The clamped neighbourhood `[position - padding, position + padding]` used to
    /// process the chunk at `position`.
    pub fn neighbourhood(&self, position: usize) -> Range<usize> {
        position.saturating_sub(self.padding)..(position + self.padding + 1).min(self.len())
    }

    /// Run lengths of all workers, in worker order.
    pub fn run_lengths(&self) -> Vec<usize> {
        self.runs.iter().map(|run| run.len()).collect()
    }
}
