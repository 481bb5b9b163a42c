//! The stage contract.
//!
//! A stage is one step of a pipeline: it declares its parameters and which
//! workers it needs, describes its input requirements and outputs at setup, and
//! transforms chunks. The engine never calls a `Stage` directly; it drives it
//! through a [`StageRunner`], which owns the lifecycle state machine.

use std::fmt;

use ndarray::ArrayD;
use serde_json::{Map, Value};

use crate::data::{Backing, Chunk, Dataset, Pattern};
use crate::error::{PipelineError, Result};
use crate::runtime::dispatch::Requirement;

//==================================================================================
// 1. Module Declarations
//==================================================================================
pub mod params;

pub use self::params::{ParamSpec, ParamType, ParamValue, Parameters};

//==================================================================================
// 2. Setup Descriptors
//==================================================================================

/// How a stage reads one of its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequirement {
    /// The pattern the input is sliced under. It must be declared on the input.
    pub pattern: String,
    /// Number of neighbouring chunks on each side handed to `process_chunk`.
    pub padding: usize,
}

impl InputRequirement {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            padding: 0,
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }
}

/// A dataset a stage will produce.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub shape: Vec<usize>,
    /// Patterns declared on the new dataset.
    pub patterns: Vec<Pattern>,
    /// The pattern chunks are written under. Must be one of `patterns`.
    pub write_pattern: String,
    pub axis_labels: Vec<String>,
}

impl OutputSpec {
    pub fn new(name: &str, shape: &[usize], write_pattern: Pattern) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            write_pattern: write_pattern.name().to_string(),
            patterns: vec![write_pattern],
            axis_labels: Vec::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_axis_labels(mut self, labels: &[&str]) -> Self {
        self.axis_labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }
}

/// Everything a stage declares at setup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageSetup {
    pub inputs: Vec<InputRequirement>,
    pub outputs: Vec<OutputSpec>,
}

/// A reference a stage asks users to cite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    pub description: String,
    pub doi: Option<String>,
}

/// What a stage knows about the worker running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    /// Rank within the workers that run this stage.
    pub rank: usize,
    pub size: usize,
    /// Compute units this worker may use (greater than 1 only for leader stages).
    pub available_units: usize,
    pub stage_index: usize,
    /// The virtual run, and its position in the tuning grid.
    pub run: usize,
    pub tuning_index: Vec<usize>,
    pub backing: Backing,
}

//==================================================================================
// 3. The Stage Trait
//==================================================================================

/// **CONTRACT:** The trait every pipeline stage implements.
///
/// Only `name` is mandatory to compile, but a stage that does not override
/// `setup` and `process_chunk` fails with [`PipelineError::NotImplemented`] the
/// first time the engine needs them.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// The parameter schema. User values are bound against it before any stage runs.
    fn parameters(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Which workers take part in this stage.
    fn requirement(&self) -> Requirement {
        Requirement::Any
    }

    /// Declares input requirements and outputs. `inputs` are every dataset
    /// available to the stage, in declaration order.
    fn setup(&mut self, inputs: &[Dataset], params: &Parameters) -> Result<StageSetup> {
        let _ = (inputs, params);
        Err(PipelineError::NotImplemented {
            stage: self.name().to_string(),
            method: "setup",
        })
    }

    /// Called once per virtual run before its first chunk. `inputs` are the
    /// datasets the stage declared, fully written, so global statistics can be
    /// gathered here.
    fn pre_process(&mut self, ctx: &StageContext, inputs: &[Dataset], params: &Parameters) -> Result<()> {
        let _ = (ctx, inputs, params);
        Ok(())
    }

    /// Transforms one chunk per input into one array per output.
    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        let _ = chunks;
        Err(PipelineError::NotImplemented {
            stage: self.name().to_string(),
            method: "process_chunk",
        })
    }

    /// Called once per virtual run after its last chunk.
    fn post_process(&mut self, ctx: &StageContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn citation(&self) -> Option<Citation> {
        None
    }

    fn executive_summary(&self) -> Vec<String> {
        vec!["Nothing to Report".to_string()]
    }
}

//==================================================================================
// 4. Lifecycle
//==================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Parameterized,
    Setup,
    PreProcess,
    ProcessChunk,
    PostProcess,
    Finalized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Owns a stage and enforces
/// `Created -> Parameterized -> Setup -> (PreProcess -> ProcessChunk* -> PostProcess)+ -> Finalized`,
/// where the bracketed block repeats once per tuning run. A worker the
/// dispatcher skips goes from `Setup` straight to `Finalized`.
pub struct StageRunner {
    stage: Box<dyn Stage>,
    state: LifecycleState,
    params: Parameters,
    setup: Option<StageSetup>,
    runs_done: usize,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage", &self.stage.name())
            .field("state", &self.state)
            .field("runs_done", &self.runs_done)
            .finish()
    }
}

impl StageRunner {
    pub fn new(stage: Box<dyn Stage>) -> Self {
        let params = Parameters::empty(stage.name());
        Self {
            stage,
            state: LifecycleState::Created,
            params,
            setup: None,
            runs_done: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// The descriptor returned by `setup`, once it has run.
    pub fn descriptor(&self) -> Option<&StageSetup> {
        self.setup.as_ref()
    }

    fn transition(&mut self, to: LifecycleState) -> Result<()> {
        use LifecycleState::*;
        let more_runs = self.runs_done < self.params.run_count();
        let allowed = match (self.state, to) {
            (Created, Parameterized) | (Parameterized, Setup) => true,
            (Setup, PreProcess) | (Setup, Finalized) => true,
            (PreProcess, ProcessChunk) | (ProcessChunk, ProcessChunk) => true,
            (PreProcess, PostProcess) | (ProcessChunk, PostProcess) => true,
            (PostProcess, PreProcess) => more_runs,
            (PostProcess, Finalized) => !more_runs,
            _ => false,
        };
        if !allowed {
            return Err(PipelineError::LifecycleViolation {
                stage: self.name().to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Binds the user's raw parameter map against the stage's schema.
    pub fn parameterize(&mut self, raw: &Map<String, Value>) -> Result<()> {
        self.transition(LifecycleState::Parameterized)?;
        let schema = self.stage.parameters();
        self.params = params::bind(self.stage.name(), &schema, raw)?;
        Ok(())
    }

    /// Runs the stage's setup against the available datasets. Setup sees the
    /// parameters of the first tuning run.
    pub fn setup(&mut self, inputs: &[Dataset]) -> Result<&StageSetup> {
        self.transition(LifecycleState::Setup)?;
        let first_run = self.params.for_run(0)?;
        let descriptor = self.stage.setup(inputs, &first_run)?;
        if descriptor.inputs.len() > inputs.len() {
            return Err(PipelineError::DatasetCountMismatch {
                stage: self.name().to_string(),
                required: descriptor.inputs.len(),
                available: inputs.len(),
            });
        }
        Ok(self.setup.insert(descriptor))
    }

    pub fn pre_process(&mut self, ctx: &StageContext, inputs: &[Dataset]) -> Result<()> {
        self.transition(LifecycleState::PreProcess)?;
        let run_params = self.params.for_run(ctx.run)?;
        self.stage.pre_process(ctx, inputs, &run_params)
    }

    pub fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        self.transition(LifecycleState::ProcessChunk)?;
        self.stage.process_chunk(chunks)
    }

    pub fn post_process(&mut self, ctx: &StageContext) -> Result<()> {
        self.transition(LifecycleState::PostProcess)?;
        self.runs_done += 1;
        self.stage.post_process(ctx)
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.transition(LifecycleState::Finalized)
    }
}
