// In: src/data/dataset.rs

//! The dataset handle: one N-dimensional `f64` array, its patterns and metadata,
//! and a storage backing that is either a persistent store entry or a buffer held
//! in memory. Chunk reads and writes behave identically for both backings.
//!
//! A `Dataset` value is cheap to clone. Clones share the same storage (so every
//! worker writes into the same array) but own their pattern registry and metadata,
//! the way each worker process holds its own view of a shared file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{ArrayD, Axis, IxDyn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::pattern::{Pattern, PatternRegistry};
use crate::data::slicing::{SliceIndex, SlicePlan};
use crate::data::store::{BackingStore, StoreHandle};
use crate::error::{PipelineError, Result};

/// Where a dataset's elements live.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backing {
    Persistent,
    InMemory,
}

pub(crate) enum Storage {
    Memory(RwLock<ArrayD<f64>>),
    Persistent {
        store: Arc<dyn BackingStore>,
        handle: StoreHandle,
        path: PathBuf,
    },
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Memory(buffer) => write!(f, "Memory({:?})", buffer.read().shape()),
            Storage::Persistent { handle, path, .. } => {
                write!(f, "Persistent({}, {:?})", path.display(), handle)
            }
        }
    }
}

/// One chunk handed to a stage: the data for a single slice position, or its
/// padded neighbourhood stacked along a new leading axis.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: ArrayD<f64>,
    /// The slice index of the chunk being processed.
    pub index: SliceIndex,
    /// Its position in the canonical global order.
    pub position: usize,
    /// Offset of the processed frame along axis 0 when `data` is a stacked
    /// neighbourhood, `None` when the stage asked for no padding.
    pub centre: Option<usize>,
}

impl Chunk {
    /// The frame at the chunk's own position, with any padding stripped.
    pub fn frame(&self) -> ndarray::ArrayViewD<'_, f64> {
        match self.centre {
            Some(centre) => self.data.index_axis(Axis(0), centre),
            None => self.data.view(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    name: String,
    shape: Vec<usize>,
    patterns: PatternRegistry,
    axis_labels: Vec<String>,
    metadata: BTreeMap<String, Value>,
    previous_pattern: Option<Pattern>,
    storage: Arc<Storage>,
}

impl Dataset {
    //==============================================================================
    // Construction
    //==============================================================================

    /// A zero-filled in-memory dataset.
    pub fn in_memory(name: &str, shape: &[usize]) -> Self {
        Self::from_storage(
            name,
            shape,
            Storage::Memory(RwLock::new(ArrayD::zeros(IxDyn(shape)))),
        )
    }

    /// An in-memory dataset holding `array`.
    pub fn from_array(name: &str, array: ArrayD<f64>) -> Self {
        let shape = array.shape().to_vec();
        Self::from_storage(name, &shape, Storage::Memory(RwLock::new(array)))
    }

    /// A dataset backed by an open store entry.
    pub fn persistent(
        name: &str,
        shape: &[usize],
        store: Arc<dyn BackingStore>,
        handle: StoreHandle,
        path: &Path,
    ) -> Self {
        Self::from_storage(
            name,
            shape,
            Storage::Persistent {
                store,
                handle,
                path: path.to_path_buf(),
            },
        )
    }

    fn from_storage(name: &str, shape: &[usize], storage: Storage) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            patterns: PatternRegistry::new(shape.len()),
            axis_labels: Vec::new(),
            metadata: BTreeMap::new(),
            previous_pattern: None,
            storage: Arc::new(storage),
        }
    }

    //==============================================================================
    // Accessors
    //==============================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backing(&self) -> Backing {
        match *self.storage {
            Storage::Memory(_) => Backing::InMemory,
            Storage::Persistent { .. } => Backing::Persistent,
        }
    }

    /// The store entry behind a persistent dataset.
    pub fn store_handle(&self) -> Option<(Arc<dyn BackingStore>, StoreHandle)> {
        match &*self.storage {
            Storage::Persistent { store, handle, .. } => Some((Arc::clone(store), *handle)),
            Storage::Memory(_) => None,
        }
    }

    /// True when both handles point at the same underlying storage.
    pub fn shares_storage_with(&self, other: &Dataset) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    //==============================================================================
    // Patterns
    //==============================================================================

    pub fn declare_pattern(&mut self, name: &str, core_axes: &[usize], slice_axes: &[usize]) -> Result<()> {
        self.patterns.declare_pattern(name, core_axes, slice_axes)
    }

    pub fn add_pattern(&mut self, pattern: Pattern) -> Result<()> {
        self.patterns.insert(pattern)
    }

    pub fn get_pattern(&self, name: &str) -> Result<&Pattern> {
        self.patterns.get_pattern(name)
    }

    pub fn patterns(&self) -> &PatternRegistry {
        &self.patterns
    }

    pub fn finalise_patterns(&mut self) {
        self.patterns.finalise();
    }

    pub fn previous_pattern(&self) -> Option<&Pattern> {
        self.previous_pattern.as_ref()
    }

    pub(crate) fn set_previous_pattern(&mut self, pattern: Pattern) {
        self.previous_pattern = Some(pattern);
    }

    //==============================================================================
    // Metadata
    //==============================================================================

    pub fn axis_labels(&self) -> &[String] {
        &self.axis_labels
    }

    pub fn set_axis_labels(&mut self, labels: Vec<String>) -> Result<()> {
        if !labels.is_empty() && labels.len() != self.ndim() {
            return Err(PipelineError::ShapeMismatch {
                expected: vec![self.ndim()],
                actual: vec![labels.len()],
            });
        }
        self.axis_labels = labels;
        Ok(())
    }

    /// The axis carrying `label`, if any.
    pub fn axis_by_label(&self, label: &str) -> Option<usize> {
        self.axis_labels.iter().position(|l| l == label)
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    //==============================================================================
    // Chunk I/O
    //==============================================================================

    /// Reads the chunk at `index` under `pattern`. The chunk's axes are the
    /// pattern's core axes in declared order. Unwritten in-memory regions read as 0.
    pub fn read_chunk(&self, pattern: &str, index: &[usize]) -> Result<ArrayD<f64>> {
        let pattern = self.patterns.get_pattern(pattern)?;
        let fixed = self.fixed_axes(pattern, index)?;
        let perm = declared_order(pattern.core_axes());

        match &*self.storage {
            Storage::Memory(buffer) => {
                let guard = buffer.read();
                let mut view = guard.view();
                for &(axis, i) in fixed.iter().rev() {
                    view = view.index_axis_move(Axis(axis), i);
                }
                Ok(view.permuted_axes(perm).to_owned())
            }
            Storage::Persistent { store, handle, .. } => {
                let region = self.region(&fixed);
                let mut slab = store.read_region(*handle, &region)?;
                for &(axis, _) in fixed.iter().rev() {
                    slab = slab.index_axis_move(Axis(axis), 0);
                }
                Ok(slab.permuted_axes(perm).as_standard_layout().into_owned())
            }
        }
    }

    /// Writes `chunk` at `index` under `pattern`. The chunk shape must equal the
    /// pattern's core extents in declared order.
    pub fn write_chunk(&self, pattern: &str, index: &[usize], chunk: &ArrayD<f64>) -> Result<()> {
        let pattern = self.patterns.get_pattern(pattern)?;
        let fixed = self.fixed_axes(pattern, index)?;
        let expected = pattern.chunk_shape(&self.shape);
        if chunk.shape() != expected.as_slice() {
            return Err(PipelineError::ShapeMismatch {
                expected,
                actual: chunk.shape().to_vec(),
            });
        }

        match &*self.storage {
            Storage::Memory(buffer) => {
                let mut guard = buffer.write();
                let mut view = guard.view_mut();
                for &(axis, i) in fixed.iter().rev() {
                    view = view.index_axis_move(Axis(axis), i);
                }
                let mut target = view.permuted_axes(declared_order(pattern.core_axes()));
                target.assign(chunk);
                Ok(())
            }
            Storage::Persistent { store, handle, .. } => {
                let mut slab = chunk.view().permuted_axes(ascending_order(pattern.core_axes()));
                for &(axis, _) in fixed.iter() {
                    slab = slab.insert_axis(Axis(axis));
                }
                let region = self.region(&fixed);
                store.write_region(*handle, &region, &slab.as_standard_layout().into_owned())
            }
        }
    }

    /// Reads the chunk at `position` of `plan`, stacking the plan's padded
    /// neighbourhood along a new leading axis when the plan carries padding.
    /// Neighbours owned by other workers are read straight from the storage.
    pub fn read_neighbourhood(&self, pattern: &str, plan: &SlicePlan, position: usize) -> Result<Chunk> {
        let index = plan.index(position).clone();
        if plan.padding() == 0 {
            return Ok(Chunk {
                data: self.read_chunk(pattern, &index)?,
                index,
                position,
                centre: None,
            });
        }

        let neighbourhood = plan.neighbourhood(position);
        let frames = neighbourhood
            .clone()
            .map(|p| self.read_chunk(pattern, plan.index(p)))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        let data = ndarray::stack(Axis(0), &views)?;
        Ok(Chunk {
            data,
            index,
            position,
            centre: Some(position - neighbourhood.start),
        })
    }

    /// Reads every element into memory.
    pub fn to_array(&self) -> Result<ArrayD<f64>> {
        match &*self.storage {
            Storage::Memory(buffer) => Ok(buffer.read().clone()),
            Storage::Persistent { store, handle, .. } => {
                let region: Vec<Range<usize>> = self.shape.iter().map(|&n| 0..n).collect();
                store.read_region(*handle, &region)
            }
        }
    }

    /// A fresh in-memory dataset holding the same elements (row-major) under
    /// `new_shape`, with `new_pattern` declared. The source is left untouched.
    pub fn reshape(&self, new_shape: &[usize], new_pattern: Pattern) -> Result<Dataset> {
        let new_len: usize = new_shape.iter().product();
        if new_len != self.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: new_shape.to_vec(),
            });
        }
        let values: Vec<f64> = self.to_array()?.iter().copied().collect();
        let array = ArrayD::from_shape_vec(IxDyn(new_shape), values)?;

        let mut reshaped = Dataset::from_array(&self.name, array);
        reshaped.metadata = self.metadata.clone();
        reshaped.add_pattern(new_pattern)?;
        Ok(reshaped)
    }

    /// Validates `index` against `pattern` and pairs each slice axis with its
    /// index, sorted by axis.
    fn fixed_axes(&self, pattern: &Pattern, index: &[usize]) -> Result<Vec<(usize, usize)>> {
        let slice_axes = pattern.slice_axes();
        let extents: Vec<usize> = slice_axes.iter().map(|&axis| self.shape[axis]).collect();
        let in_range = index.len() == slice_axes.len()
            && index.iter().zip(&extents).all(|(&i, &n)| i < n);
        if !in_range {
            return Err(PipelineError::ShapeMismatch {
                expected: extents,
                actual: index.to_vec(),
            });
        }

        let mut fixed: Vec<(usize, usize)> = slice_axes.iter().copied().zip(index.iter().copied()).collect();
        fixed.sort_unstable();
        Ok(fixed)
    }

    fn region(&self, fixed: &[(usize, usize)]) -> Vec<Range<usize>> {
        let mut region: Vec<Range<usize>> = self.shape.iter().map(|&n| 0..n).collect();
        for &(axis, i) in fixed {
            region[axis] = i..i + 1;
        }
        region
    }
}

/// Permutation taking core axes from ascending array order to declared order.
fn declared_order(core_axes: &[usize]) -> Vec<usize> {
    let mut sorted = core_axes.to_vec();
    sorted.sort_unstable();
    core_axes
        .iter()
        .map(|axis| sorted.iter().position(|a| a == axis).unwrap_or(0))
        .collect()
}

/// Permutation taking core axes from declared order back to ascending array order.
fn ascending_order(core_axes: &[usize]) -> Vec<usize> {
    let mut sorted = core_axes.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|axis| core_axes.iter().position(|a| a == axis).unwrap_or(0))
        .collect()
}

/// Copies metadata from every input onto every output. Keys named after an axis
/// label that exists on some input but not on the output are dropped, and an
/// output's own keys take precedence over copied ones.
pub fn copy_metadata(inputs: &[Dataset], outputs: &mut [Dataset]) {
    let mut merged = BTreeMap::new();
    let mut input_labels = BTreeSet::new();
    for input in inputs {
        merged.extend(input.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        input_labels.extend(input.axis_labels.iter().cloned());
    }

    for output in outputs.iter_mut() {
        let own_labels: BTreeSet<&String> = output.axis_labels.iter().collect();
        let mut copied = merged.clone();
        for label in &input_labels {
            if !own_labels.contains(label) {
                copied.remove(label);
            }
        }
        copied.extend(std::mem::take(&mut output.metadata));
        output.metadata = copied;
    }
}
