// In: src/runtime/launch.rs

//! Runs a pipeline on a fixed fleet of worker threads in this process.

use std::path::PathBuf;
use std::thread::{self, ScopedJoinHandle};

use crate::config::RunConfig;
use crate::data::{Dataset, Pattern};
use crate::error::{ErrorClass, PipelineError, Result};
use crate::runtime::comm::{Communicator, LocalCommunicator};
use crate::runtime::context::RunContext;
use crate::runtime::driver::Pipeline;

/// A persistent source every worker opens before the first stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: String,
    pub path: PathBuf,
    pub patterns: Vec<Pattern>,
    pub axis_labels: Vec<String>,
}

impl SourceSpec {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            patterns: Vec::new(),
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

/// Aborts the fleet if the owning worker thread unwinds.
struct AbortOnPanic<'a>(&'a LocalCommunicator);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort(&format!("worker {} panicked", self.0.rank()));
        }
    }
}

/// Spawns `config.workers` threads, builds a pipeline on each with `build`, opens
/// `sources` and runs the pipeline. Logging is installed at `config.log_level`
/// unless the process already has a logger. Returns rank 0's outputs, or the error that
/// aborted the fleet.
pub fn run_local<B>(config: &RunConfig, sources: &[SourceSpec], build: B) -> Result<Vec<Dataset>>
where
    B: Fn(&RunContext) -> Result<Pipeline> + Sync,
{
    config.validate()?;
    crate::observability::init_logging(&config.log_level, None)?;
    let fleet = LocalCommunicator::fleet(config.workers);
    let supervisor = fleet[0].clone();
    let build = &build;

    let outcomes: Vec<Result<Vec<Dataset>>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(fleet.len());
        for comm in fleet {
            let rank = comm.rank();
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", rank))
                .spawn_scoped(s, move || {
                    let _guard = AbortOnPanic(&comm);
                    let result = run_worker(config, &comm, sources, build);
                    if let Err(e) = &result {
                        comm.abort(&e.to_string());
                    }
                    result
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    supervisor.abort(&format!("could not spawn worker {}: {}", rank, e));
                    let mut outcomes = join_all(handles);
                    outcomes.push(Err(e.into()));
                    return outcomes;
                }
            }
        }
        join_all(handles)
    });

    select_outcome(outcomes, supervisor.abort_reason())
}

fn run_worker<B>(
    config: &RunConfig,
    comm: &LocalCommunicator,
    sources: &[SourceSpec],
    build: &B,
) -> Result<Vec<Dataset>>
where
    B: Fn(&RunContext) -> Result<Pipeline>,
{
    let ctx = RunContext::new(config, comm.rank())?;
    let mut pipeline = build(&ctx)?;

    let mut datasets = Vec::with_capacity(sources.len());
    for source in sources {
        let opened = pipeline
            .open_source(&ctx, comm, &source.path, &source.name)
            .and_then(|mut dataset| {
                for pattern in &source.patterns {
                    dataset.add_pattern(pattern.clone())?;
                }
                dataset.set_axis_labels(source.axis_labels.clone())?;
                Ok(dataset)
            });
        match opened {
            Ok(dataset) => datasets.push(dataset),
            Err(e) => {
                pipeline.abort(comm, &e);
                return Err(e);
            }
        }
    }

    pipeline.run(&ctx, comm, datasets)
}

fn join_all(handles: Vec<ScopedJoinHandle<'_, Result<Vec<Dataset>>>>) -> Vec<Result<Vec<Dataset>>> {
    handles
        .into_iter()
        .enumerate()
        .map(|(rank, handle)| {
            handle
                .join()
                .unwrap_or_else(|_| Err(PipelineError::Aborted(format!("worker {} panicked", rank))))
        })
        .collect()
}

/// The error that caused the abort wins over the errors it induced in peers.
fn select_outcome(outcomes: Vec<Result<Vec<Dataset>>>, abort_reason: Option<String>) -> Result<Vec<Dataset>> {
    let mut first_ok = None;
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(datasets) => {
                first_ok.get_or_insert(datasets);
            }
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        return first_ok.ok_or_else(|| PipelineError::Aborted("no worker produced a result".to_string()));
    }

    let cause = abort_reason
        .and_then(|reason| errors.iter().position(|e| e.to_string() == reason))
        .or_else(|| errors.iter().position(|e| e.class() != ErrorClass::Coordination))
        .unwrap_or(0);
    Err(errors.swap_remove(cause))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_outcome_prefers_abort_cause() {
        let outcomes = vec![
            Err(PipelineError::Aborted("x".into()).in_stage("s")),
            Err(PipelineError::BackingStore("handle 3 is not open".into())),
            Err(PipelineError::Partition("bad".into())),
        ];
        let reason = PipelineError::Partition("bad".into()).to_string();
        let err = select_outcome(outcomes, Some(reason)).unwrap_err();
        assert!(matches!(err, PipelineError::Partition(_)));
    }

    #[test]
    fn test_select_outcome_returns_first_result() {
        let outcomes = vec![Ok(vec![Dataset::in_memory("a", &[1])]), Ok(vec![])];
        assert_eq!(select_outcome(outcomes, None).unwrap().len(), 1);
    }

    #[test]
    fn test_run_installs_logging_at_configured_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            log_level: "info".to_string(),
            ..RunConfig::with_workers(2, dir.path())
        };
        let store: std::sync::Arc<dyn crate::data::BackingStore> =
            std::sync::Arc::new(crate::data::RawFileStore::new());
        let outputs = run_local(&config, &[], |_ctx| {
            Ok(Pipeline::new(
                Vec::new(),
                Box::new(crate::runtime::transport::BasicTransport::new(store.clone())),
            ))
        })
        .unwrap();
        assert!(outputs.is_empty());
        assert!(log::max_level() >= log::LevelFilter::Info);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_spawning() {
        let config = RunConfig {
            workers: 0,
            ..RunConfig::default()
        };
        let result = run_local(&config, &[], |_ctx| unreachable!());
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
