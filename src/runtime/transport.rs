// In: src/runtime/transport.rs

//! The transport decides where datasets live as the pipeline advances.
//!
//! Sources are read from persistent storage, every intermediate stage writes to
//! memory, and the final stage writes back to persistent storage. The switch is
//! driven by a counter of completed stages: persistent output is prepared when
//! `count == n_stages - 1` and closed when that stage completes.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::data::{Backing, BackingStore, Dataset, OpenMode, Pattern, PatternRegistry, StoreHandle};
use crate::error::Result;
use crate::runtime::comm::{broadcast, Communicator};
use crate::runtime::context::RunContext;
use crate::stage::OutputSpec;

/// Which producer each stage reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFlow {
    /// `producers[i]` is the stage whose outputs stage `i` reads, `None` for the
    /// pipeline's sources.
    producers: Vec<Option<usize>>,
}

impl DataFlow {
    /// A chain in which every stage reads its predecessor's outputs.
    pub fn linear(n_stages: usize) -> Self {
        Self {
            producers: (0..n_stages).map(|i| i.checked_sub(1)).collect(),
        }
    }

    /// The number of processing stages.
    pub fn n_stages(&self) -> usize {
        self.producers.len()
    }

    pub fn producer(&self, stage: usize) -> Option<usize> {
        self.producers.get(stage).copied().flatten()
    }

    /// The last stage that reads the sources directly.
    pub fn last_source_reader(&self) -> Option<usize> {
        self.producers.iter().rposition(Option::is_none)
    }
}

/// **CONTRACT:** Backing transitions around the stages of one run.
///
/// Every method is called on every worker, in lockstep. Methods that take a
/// communicator are collective.
pub trait Transport: Send {
    fn initialise(&mut self, ctx: &RunContext) -> Result<()>;

    /// Opens a persistent source on every worker.
    fn open_source(&mut self, comm: &dyn Communicator, path: &Path, name: &str) -> Result<Dataset>;

    fn pre_run(&mut self, flow: &DataFlow) -> Result<()>;

    fn pre_stage(&mut self, ctx: &RunContext) -> Result<()>;

    /// Creates the stage's output datasets with the current backing. Every worker
    /// receives handles on the same storage.
    fn create_outputs(
        &mut self,
        ctx: &RunContext,
        comm: &dyn Communicator,
        specs: &[OutputSpec],
    ) -> Result<Vec<Dataset>>;

    /// Called after the stage-boundary barrier.
    fn post_stage(&mut self, ctx: &RunContext, comm: &dyn Communicator, outputs: &[Dataset]) -> Result<()>;

    fn post_run(&mut self, comm: &dyn Communicator) -> Result<()>;

    /// The backing outputs of the current stage are created with.
    fn backing(&self) -> Backing;

    /// Number of completed stages.
    fn count(&self) -> usize;

    /// Best-effort release of everything this transport opened. Errors are logged.
    fn abort_cleanup(&mut self);
}

//==================================================================================
// BasicTransport
//==================================================================================

/// Memory for intermediates, a [`BackingStore`] for sources and final outputs.
///
/// Only rank 0 calls `open`, `create` and `close` on the store; the resulting
/// handles are broadcast, so every worker's transport must share the same store.
#[derive(Debug)]
pub struct BasicTransport {
    store: Arc<dyn BackingStore>,
    backing: Backing,
    count: usize,
    flow: DataFlow,
    keep_sources_open: bool,
    sources: Vec<StoreHandle>,
    outputs: Vec<StoreHandle>,
}

impl BasicTransport {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            backing: Backing::Persistent,
            count: 0,
            flow: DataFlow::linear(0),
            keep_sources_open: true,
            sources: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    fn is_final(&self) -> bool {
        self.flow.n_stages() > 0 && self.count == self.flow.n_stages() - 1
    }

    fn close_all(&self, handles: Vec<StoreHandle>) -> Result<()> {
        for handle in handles {
            self.store.close(handle)?;
        }
        Ok(())
    }

    /// Builds the output datasets on the root worker.
    fn build_outputs(&mut self, ctx: &RunContext, specs: &[OutputSpec]) -> Result<Vec<Dataset>> {
        if self.backing == Backing::Persistent && !specs.is_empty() {
            fs::create_dir_all(&ctx.output_dir)?;
        }

        let mut datasets = Vec::with_capacity(specs.len());
        for spec in specs {
            let patterns = validated_patterns(spec)?;
            let mut dataset = match self.backing {
                Backing::InMemory => Dataset::in_memory(&spec.name, &spec.shape),
                Backing::Persistent => {
                    let path = ctx.output_path(&spec.name);
                    let write = patterns.get_pattern(&spec.write_pattern)?;
                    let chunking = chunking_for(&spec.shape, write, ctx.chunking_hint);
                    let handle = self.store.create(&path, &spec.shape, "f64", &chunking)?;
                    self.outputs.push(handle);
                    log::info!("Created persistent output '{}' at {}", spec.name, path.display());
                    Dataset::persistent(&spec.name, &spec.shape, Arc::clone(&self.store), handle, &path)
                }
            };
            for pattern in &spec.patterns {
                dataset.add_pattern(pattern.clone())?;
            }
            dataset.set_axis_labels(spec.axis_labels.clone())?;
            datasets.push(dataset);
        }
        Ok(datasets)
    }
}

/// Checks every pattern of `spec` against its shape and that the write pattern is
/// among them, before anything is allocated.
fn validated_patterns(spec: &OutputSpec) -> Result<PatternRegistry> {
    let mut registry = PatternRegistry::new(spec.shape.len());
    for pattern in &spec.patterns {
        registry.insert(pattern.clone())?;
    }
    registry.get_pattern(&spec.write_pattern)?;
    Ok(registry)
}

/// Store chunking for an output: whole core extents, and up to `hint` positions
/// along the innermost slice axis.
fn chunking_for(shape: &[usize], pattern: &Pattern, hint: usize) -> Vec<usize> {
    let mut chunking = shape.to_vec();
    for &axis in pattern.slice_axes() {
        chunking[axis] = 1;
    }
    if let Some(&inner) = pattern.slice_axes().last() {
        chunking[inner] = hint.min(shape[inner]).max(1);
    }
    chunking
}

impl Transport for BasicTransport {
    fn initialise(&mut self, ctx: &RunContext) -> Result<()> {
        // Sources are always read from persistent storage.
        self.backing = Backing::Persistent;
        self.keep_sources_open = ctx.keep_sources_open;
        self.count = 0;
        Ok(())
    }

    fn open_source(&mut self, comm: &dyn Communicator, path: &Path, name: &str) -> Result<Dataset> {
        let opened = if comm.rank() == 0 {
            let handle = self.store.open(path, OpenMode::Read)?;
            self.sources.push(handle);
            Some((handle, self.store.shape(handle)?))
        } else {
            None
        };
        let (handle, shape) = broadcast(comm, 0, opened)?;
        Ok(Dataset::persistent(name, &shape, Arc::clone(&self.store), handle, path))
    }

    fn pre_run(&mut self, flow: &DataFlow) -> Result<()> {
        // Loaders are done; new datasets default to memory from here on.
        self.flow = flow.clone();
        self.backing = Backing::InMemory;
        self.count = 0;
        Ok(())
    }

    fn pre_stage(&mut self, ctx: &RunContext) -> Result<()> {
        if self.is_final() {
            self.backing = Backing::Persistent;
            log::info!(
                "Stage {} of {} is final: outputs go to {}",
                self.count + 1,
                self.flow.n_stages(),
                ctx.output_dir.display()
            );
        }
        Ok(())
    }

    fn create_outputs(
        &mut self,
        ctx: &RunContext,
        comm: &dyn Communicator,
        specs: &[OutputSpec],
    ) -> Result<Vec<Dataset>> {
        let built = if comm.rank() == 0 {
            Some(self.build_outputs(ctx, specs)?)
        } else {
            None
        };
        broadcast(comm, 0, built)
    }

    fn post_stage(&mut self, _ctx: &RunContext, comm: &dyn Communicator, outputs: &[Dataset]) -> Result<()> {
        if self.is_final() {
            if comm.rank() == 0 {
                let handles = std::mem::take(&mut self.outputs);
                self.close_all(handles)?;
                for output in outputs {
                    log_metric!("event" = "output_closed", "dataset" = output.name());
                }
            }
            comm.barrier()?;
        }

        let sources_done = self.flow.last_source_reader() == Some(self.count);
        if sources_done && !self.keep_sources_open && comm.rank() == 0 {
            let handles = std::mem::take(&mut self.sources);
            self.close_all(handles)?;
        }

        self.count += 1;
        Ok(())
    }

    fn post_run(&mut self, comm: &dyn Communicator) -> Result<()> {
        comm.barrier()?;
        if comm.rank() == 0 {
            let handles = std::mem::take(&mut self.sources);
            self.close_all(handles)?;
        }
        Ok(())
    }

    fn backing(&self) -> Backing {
        self.backing
    }

    fn count(&self) -> usize {
        self.count
    }

    fn abort_cleanup(&mut self) {
        let handles: Vec<StoreHandle> = self.outputs.drain(..).chain(self.sources.drain(..)).collect();
        for handle in handles {
            if let Err(e) = self.store.close(handle) {
                log::warn!("Failed to close {:?} during abort: {}", handle, e);
            }
        }
    }
}
