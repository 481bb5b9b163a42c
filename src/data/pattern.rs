// In: src/data/pattern.rs

//! Named slicing patterns and the per-dataset registry that holds them.
//!
//! A pattern splits the axes of an N-dimensional array into *core* axes, which
//! together form one independently processable unit (a frame, a spectrum), and
//! *slice* axes, which are iterated over to enumerate those units.

use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};

/// Well-known pattern names.
pub mod names {
    pub const PROJECTION: &str = "PROJECTION";
    pub const SINOGRAM: &str = "SINOGRAM";
    pub const SPECTRUM: &str = "SPECTRUM";
    pub const FRAME: &str = "FRAME";
}

/// The role an axis plays under a given pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisRole {
    Core,
    Slice,
}

/// A validated axis classification. Axis order inside each list is significant:
/// core axes give the axis order of a chunk, slice axes give the enumeration order
/// (first slice axis varies slowest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    name: String,
    core_axes: Vec<usize>,
    slice_axes: Vec<usize>,
}

impl Pattern {
    /// Builds a pattern for an array with `ndim` axes, enforcing that core and slice
    /// axes are disjoint, in range, and together cover every axis exactly once.
    pub fn new(name: &str, core_axes: &[usize], slice_axes: &[usize], ndim: usize) -> Result<Self> {
        let invalid = |reason: String| PipelineError::InvalidPattern {
            name: name.to_string(),
            reason,
        };

        let mut seen = vec![false; ndim];
        for &axis in core_axes.iter().chain(slice_axes) {
            if axis >= ndim {
                return Err(invalid(format!(
                    "axis {} is out of range for a {}-dimensional dataset",
                    axis, ndim
                )));
            }
            if seen[axis] {
                return Err(invalid(format!("axis {} is declared more than once", axis)));
            }
            seen[axis] = true;
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(invalid(format!("axis {} is neither core nor slice", missing)));
        }

        Ok(Self {
            name: name.to_string(),
            core_axes: core_axes.to_vec(),
            slice_axes: slice_axes.to_vec(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core_axes(&self) -> &[usize] {
        &self.core_axes
    }

    pub fn slice_axes(&self) -> &[usize] {
        &self.slice_axes
    }

    pub fn ndim(&self) -> usize {
        self.core_axes.len() + self.slice_axes.len()
    }

    /// The axis -> role mapping.
    pub fn roles(&self) -> Vec<AxisRole> {
        let mut roles = vec![AxisRole::Core; self.ndim()];
        for &axis in &self.slice_axes {
            roles[axis] = AxisRole::Slice;
        }
        roles
    }

    /// The shape of one chunk of an array with `shape` under this pattern.
    pub fn chunk_shape(&self, shape: &[usize]) -> Vec<usize> {
        self.core_axes.iter().map(|&axis| shape[axis]).collect()
    }

    /// The same pattern on an array with `extra` new leading axes. The new axes
    /// become the outermost slice axes; every existing axis index shifts by `extra`.
    pub fn shifted(&self, extra: usize) -> Self {
        let slice_axes = (0..extra)
            .chain(self.slice_axes.iter().map(|&axis| axis + extra))
            .collect();
        Self {
            name: self.name.clone(),
            core_axes: self.core_axes.iter().map(|&axis| axis + extra).collect(),
            slice_axes,
        }
    }
}

/// The set of patterns declared on one dataset.
///
/// Before `finalise` a name may be redeclared (the last declaration wins). After
/// `finalise` existing names are frozen; new names can still be added so a later
/// stage may introduce a fresh view of the same array.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    ndim: usize,
    patterns: BTreeMap<String, Pattern>,
    locked: bool,
}

impl PatternRegistry {
    pub fn new(ndim: usize) -> Self {
        Self {
            ndim,
            patterns: BTreeMap::new(),
            locked: false,
        }
    }

    pub fn declare_pattern(&mut self, name: &str, core_axes: &[usize], slice_axes: &[usize]) -> Result<()> {
        if self.locked && self.patterns.contains_key(name) {
            return Err(PipelineError::PatternLocked(name.to_string()));
        }
        let pattern = Pattern::new(name, core_axes, slice_axes, self.ndim)?;
        self.patterns.insert(name.to_string(), pattern);
        Ok(())
    }

    /// Inserts an already validated pattern, subject to the same locking rule.
    pub fn insert(&mut self, pattern: Pattern) -> Result<()> {
        if pattern.ndim() != self.ndim {
            return Err(PipelineError::InvalidPattern {
                name: pattern.name().to_string(),
                reason: format!(
                    "pattern covers {} axes, dataset has {}",
                    pattern.ndim(),
                    self.ndim
                ),
            });
        }
        if self.locked && self.patterns.contains_key(pattern.name()) {
            return Err(PipelineError::PatternLocked(pattern.name().to_string()));
        }
        self.patterns.insert(pattern.name().to_string(), pattern);
        Ok(())
    }

    pub fn get_pattern(&self, name: &str) -> Result<&Pattern> {
        self.patterns
            .get(name)
            .ok_or_else(|| PipelineError::PatternNotFound(name.to_string()))
    }

    pub fn finalise(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }
}
