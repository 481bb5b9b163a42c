// In: src/runtime/driver.rs

//! The pipeline driver: runs an ordered list of stages on one worker, in lockstep
//! with every other worker of the fleet.
//!
//! Per stage the order is fixed: setup, `transport.pre_stage`, output creation,
//! dispatch, processing, the stage-boundary barrier, `transport.post_stage`. Each
//! stage's outputs become the next stage's inputs.

use std::path::Path;

use ndarray::ArrayD;
use serde_json::{Map, Value};

use crate::config::PipelineDefinition;
use crate::data::{copy_metadata, slicing, Chunk, Dataset, SlicePlan};
use crate::error::{PipelineError, Result};
use crate::runtime::comm::Communicator;
use crate::runtime::context::RunContext;
use crate::runtime::dispatch::{self, RunDecision};
use crate::runtime::transport::{DataFlow, Transport};
use crate::stage::{Citation, OutputSpec, Stage, StageContext, StageRunner, StageSetup};

/// An ordered chain of stages and the transport that moves data between them.
pub struct Pipeline {
    stages: Vec<StageRunner>,
    raw_params: Vec<Map<String, Value>>,
    transport: Box<dyn Transport>,
    initialised: bool,
    citations: Vec<Citation>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("count", &self.transport.count())
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<(Box<dyn Stage>, Map<String, Value>)>, transport: Box<dyn Transport>) -> Self {
        let (runners, raw_params) = stages
            .into_iter()
            .map(|(stage, params)| (StageRunner::new(stage), params))
            .unzip();
        Self {
            stages: runners,
            raw_params,
            transport,
            initialised: false,
            citations: Vec::new(),
        }
    }

    /// Builds a pipeline from a resolved definition, looking every stage up in
    /// `factory`.
    pub fn from_definition<F>(
        definition: &PipelineDefinition,
        factory: F,
        transport: Box<dyn Transport>,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<Box<dyn Stage>>,
    {
        let stages = definition
            .stages
            .iter()
            .map(|entry| {
                factory(&entry.name)
                    .map(|stage| (stage, entry.params.clone()))
                    .ok_or_else(|| PipelineError::InvalidConfig(format!("unknown stage '{}'", entry.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(stages, transport))
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(StageRunner::name).collect()
    }

    /// Citations collected from the stages that have run.
    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    fn ensure_initialised(&mut self, ctx: &RunContext) -> Result<()> {
        if !self.initialised {
            self.transport.initialise(ctx)?;
            self.initialised = true;
        }
        Ok(())
    }

    /// Opens a persistent source through the transport. Collective.
    pub fn open_source(
        &mut self,
        ctx: &RunContext,
        comm: &dyn Communicator,
        path: &Path,
        name: &str,
    ) -> Result<Dataset> {
        self.ensure_initialised(ctx)?;
        self.transport.open_source(comm, path, name)
    }

    /// Runs every stage on `sources` and returns the final stage's outputs. On
    /// failure the fleet is aborted and the transport releases what it opened.
    pub fn run(&mut self, ctx: &RunContext, comm: &dyn Communicator, sources: Vec<Dataset>) -> Result<Vec<Dataset>> {
        let result = self.run_stages(ctx, comm, sources);
        if let Err(e) = &result {
            self.abort(comm, e);
        }
        result
    }

    /// Aborts the fleet because of `err` and releases everything the transport
    /// opened on this worker.
    pub fn abort(&mut self, comm: &dyn Communicator, err: &PipelineError) {
        comm.abort(&err.to_string());
        self.transport.abort_cleanup();
    }

    fn run_stages(&mut self, ctx: &RunContext, comm: &dyn Communicator, sources: Vec<Dataset>) -> Result<Vec<Dataset>> {
        self.ensure_initialised(ctx)?;

        // Configuration errors must surface before any stage touches data.
        for (runner, raw) in self.stages.iter_mut().zip(&self.raw_params) {
            let name = runner.name().to_string();
            runner.parameterize(raw).map_err(|e| e.in_stage(&name))?;
        }

        let n_stages = self.stages.len();
        self.transport.pre_run(&DataFlow::linear(n_stages))?;
        if ctx.is_root() {
            log::info!("Running {} stage(s) on {} worker(s)", n_stages, ctx.size);
        }

        let mut datasets = sources;
        for index in 0..n_stages {
            let name = self.stages[index].name().to_string();
            datasets = self
                .run_stage(index, ctx, comm, datasets)
                .map_err(|e| e.in_stage(&name))?;
        }

        self.transport.post_run(comm)?;
        Ok(datasets)
    }

    fn run_stage(
        &mut self,
        index: usize,
        base: &RunContext,
        comm: &dyn Communicator,
        mut inputs: Vec<Dataset>,
    ) -> Result<Vec<Dataset>> {
        let n_stages = self.stages.len();
        let runner = &mut self.stages[index];
        if base.is_root() {
            log::info!("Stage {}/{}: {}", index + 1, n_stages, runner.name());
        }

        for input in &mut inputs {
            input.finalise_patterns();
        }
        let descriptor = runner.setup(&inputs)?.clone();
        let specs = tuned_specs(&descriptor.outputs, runner);

        self.transport.pre_stage(base)?;
        let ctx = base.for_stage(index, n_stages, self.transport.backing());
        let mut outputs = self.transport.create_outputs(&ctx, comm, &specs)?;
        for output in &mut outputs {
            output.finalise_patterns();
        }

        let requirement = runner.stage().requirement();
        match dispatch::assign(ctx.rank, ctx.size, &ctx.capability_tags, &requirement)? {
            RunDecision::Run {
                rank,
                size,
                available_units,
            } => {
                let worker = StageContext {
                    rank,
                    size,
                    available_units,
                    stage_index: index,
                    run: 0,
                    tuning_index: Vec::new(),
                    backing: ctx.backing,
                };
                process(runner, &worker, &inputs, &descriptor, &outputs, &specs)?;
            }
            RunDecision::Skip => {
                log::debug!("Worker {} ({}) skips stage {}", ctx.rank, ctx.tag, runner.name());
                runner.finalize()?;
            }
        }

        comm.barrier()?;
        self.transport.post_stage(&ctx, comm, &outputs)?;

        let consumed = descriptor.inputs.len();
        copy_metadata(&inputs[..consumed], &mut outputs);
        for (output, spec) in outputs.iter_mut().zip(&specs) {
            let written = output.get_pattern(&spec.write_pattern)?.clone();
            output.set_previous_pattern(written);
        }

        let stage = runner.stage();
        if ctx.is_root() {
            for line in stage.executive_summary() {
                log::info!("[{}] {}", stage.name(), line);
            }
        }
        if let Some(citation) = stage.citation() {
            self.citations.push(citation);
        }
        log_metric!("event" = "stage_complete", "stage" = stage.name(), "worker" = ctx.rank);
        Ok(outputs)
    }
}

/// Output specs as created: a tuned stage gains one leading slice axis per tuned
/// parameter.
fn tuned_specs(outputs: &[OutputSpec], runner: &StageRunner) -> Vec<OutputSpec> {
    let tuning_shape = runner.params().tuning_shape();
    if tuning_shape.is_empty() {
        return outputs.to_vec();
    }
    let extra = tuning_shape.len();
    outputs
        .iter()
        .map(|spec| {
            let mut axis_labels = Vec::new();
            if !spec.axis_labels.is_empty() {
                axis_labels.extend(runner.params().tuned_names().map(|n| format!("{}_tuning", n)));
                axis_labels.extend(spec.axis_labels.iter().cloned());
            }
            OutputSpec {
                name: spec.name.clone(),
                shape: tuning_shape.iter().chain(&spec.shape).copied().collect(),
                patterns: spec.patterns.iter().map(|p| p.shifted(extra)).collect(),
                write_pattern: spec.write_pattern.clone(),
                axis_labels,
            }
        })
        .collect()
}

/// Slice plans for every declared input (padded) and every output (on its
/// untuned shape). All plans must have the same length.
fn stage_plans(
    stage: &str,
    size: usize,
    inputs: &[Dataset],
    descriptor: &StageSetup,
) -> Result<(Vec<SlicePlan>, Vec<SlicePlan>)> {
    let input_plans = inputs
        .iter()
        .zip(&descriptor.inputs)
        .map(|(input, requirement)| {
            let pattern = input.get_pattern(&requirement.pattern)?;
            Ok(slicing::plan(input.shape(), pattern, size)?.with_padding(requirement.padding))
        })
        .collect::<Result<Vec<_>>>()?;

    let output_plans = descriptor
        .outputs
        .iter()
        .map(|spec| {
            let pattern = spec
                .patterns
                .iter()
                .find(|p| p.name() == spec.write_pattern)
                .ok_or_else(|| PipelineError::PatternNotFound(spec.write_pattern.clone()))?;
            slicing::plan(&spec.shape, pattern, size)
        })
        .collect::<Result<Vec<_>>>()?;

    let lengths: Vec<usize> = input_plans.iter().chain(&output_plans).map(SlicePlan::len).collect();
    if lengths.windows(2).any(|w| w[0] != w[1]) {
        return Err(PipelineError::Partition(format!(
            "stage '{}' has mismatched slice counts {:?} across its datasets",
            stage, lengths
        )));
    }
    Ok((input_plans, output_plans))
}

/// Runs every virtual run of the stage over this worker's share of the slices.
fn process(
    runner: &mut StageRunner,
    worker: &StageContext,
    inputs: &[Dataset],
    descriptor: &StageSetup,
    outputs: &[Dataset],
    specs: &[OutputSpec],
) -> Result<()> {
    let name = runner.name().to_string();
    let (input_plans, output_plans) = stage_plans(&name, worker.size, inputs, descriptor)?;
    let positions = input_plans
        .first()
        .or(output_plans.first())
        .map_or(0..0, |plan| plan.worker_range(worker.rank));

    for run in 0..runner.params().run_count() {
        let tuning_index = runner.params().tuning_index(run);
        let ctx = StageContext {
            run,
            tuning_index: tuning_index.clone(),
            ..worker.clone()
        };
        runner.pre_process(&ctx, &inputs[..descriptor.inputs.len()])?;

        for position in positions.clone() {
            let chunks = inputs
                .iter()
                .zip(&descriptor.inputs)
                .zip(&input_plans)
                .map(|((input, requirement), plan)| input.read_neighbourhood(&requirement.pattern, plan, position))
                .collect::<Result<Vec<Chunk>>>()?;

            let results = runner.process_chunk(&chunks)?;
            write_results(&results, &tuning_index, position, outputs, specs, &output_plans)?;
        }
        log::debug!(
            "Worker {} finished run {} of '{}' ({} chunks)",
            worker.rank,
            run,
            name,
            positions.len()
        );
        runner.post_process(&ctx)?;
    }
    runner.finalize()
}

fn write_results(
    results: &[ArrayD<f64>],
    tuning_index: &[usize],
    position: usize,
    outputs: &[Dataset],
    specs: &[OutputSpec],
    plans: &[SlicePlan],
) -> Result<()> {
    if results.len() != outputs.len() {
        return Err(PipelineError::ShapeMismatch {
            expected: vec![outputs.len()],
            actual: vec![results.len()],
        });
    }
    for (((result, output), spec), plan) in results.iter().zip(outputs).zip(specs).zip(plans) {
        let index: Vec<usize> = tuning_index.iter().chain(plan.index(position)).copied().collect();
        output.write_chunk(&spec.write_pattern, &index, result)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
