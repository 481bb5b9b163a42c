use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array, ArrayD, Axis, Ix3, IxDyn};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::*;
use crate::config::RunConfig;
use crate::data::pattern::names::FRAME;
use crate::data::{Backing, BackingStore, Pattern, RawFileStore};
use crate::error::ErrorClass;
use crate::runtime::comm::LocalCommunicator;
use crate::runtime::dispatch::Requirement;
use crate::runtime::launch::{run_local, SourceSpec};
use crate::runtime::transport::BasicTransport;
use crate::stage::Parameters;
use crate::stages::{self, NeighbourMean, Scale};

//==================================================================================
// Test Helpers
//==================================================================================

fn raw(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn ramp(shape: &[usize]) -> ArrayD<f64> {
    let n: usize = shape.iter().product();
    Array::from_iter((0..n).map(|v| v as f64))
        .into_shape_with_order(IxDyn(shape))
        .unwrap()
}

fn assert_close(actual: &ArrayD<f64>, expected: &ArrayD<f64>) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-9, "{} != {}", a, e);
    }
}

fn stage(stage: impl Stage + 'static, params: Value) -> (Box<dyn Stage>, Map<String, Value>) {
    (Box::new(stage), raw(params))
}

/// Forwards to a `BasicTransport` and records every lifecycle call.
struct RecordingTransport {
    inner: BasicTransport,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingTransport {
    fn new(store: Arc<dyn BackingStore>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            inner: BasicTransport::new(store),
            log,
        }
    }

    fn record(&self, event: String) {
        self.log.lock().push(event);
    }
}

impl Transport for RecordingTransport {
    fn initialise(&mut self, ctx: &RunContext) -> Result<()> {
        self.inner.initialise(ctx)
    }

    fn open_source(&mut self, comm: &dyn Communicator, path: &Path, name: &str) -> Result<Dataset> {
        self.inner.open_source(comm, path, name)
    }

    fn pre_run(&mut self, flow: &DataFlow) -> Result<()> {
        self.inner.pre_run(flow)?;
        self.record("pre_run".to_string());
        Ok(())
    }

    fn pre_stage(&mut self, ctx: &RunContext) -> Result<()> {
        self.inner.pre_stage(ctx)?;
        self.record(format!("pre_stage {} {:?}", self.inner.count(), self.inner.backing()));
        Ok(())
    }

    fn create_outputs(
        &mut self,
        ctx: &RunContext,
        comm: &dyn Communicator,
        specs: &[OutputSpec],
    ) -> Result<Vec<Dataset>> {
        self.inner.create_outputs(ctx, comm, specs)
    }

    fn post_stage(&mut self, ctx: &RunContext, comm: &dyn Communicator, outputs: &[Dataset]) -> Result<()> {
        let count = self.inner.count();
        self.inner.post_stage(ctx, comm, outputs)?;
        self.record(format!("post_stage {}", count));
        Ok(())
    }

    fn post_run(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.inner.post_run(comm)?;
        self.record("post_run".to_string());
        Ok(())
    }

    fn backing(&self) -> Backing {
        self.inner.backing()
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn abort_cleanup(&mut self) {
        self.inner.abort_cleanup();
        self.record("abort_cleanup".to_string());
    }
}

/// Passes frames through unchanged and records what it saw.
#[derive(Default, Clone)]
struct Observer {
    input_shapes: Arc<Mutex<Vec<Vec<usize>>>>,
    units: Arc<Mutex<Vec<usize>>>,
    requirement: Option<Requirement>,
}

impl Stage for Observer {
    fn name(&self) -> &str {
        "observer"
    }

    fn requirement(&self) -> Requirement {
        self.requirement.clone().unwrap_or(Requirement::Any)
    }

    fn setup(&mut self, inputs: &[Dataset], _params: &Parameters) -> Result<StageSetup> {
        let input = &inputs[0];
        self.input_shapes.lock().push(input.shape().to_vec());
        let pattern = input.get_pattern(FRAME)?.clone();
        Ok(StageSetup {
            inputs: vec![crate::stage::InputRequirement::new(FRAME)],
            outputs: vec![OutputSpec::new(input.name(), input.shape(), pattern)],
        })
    }

    fn pre_process(&mut self, ctx: &StageContext, _inputs: &[Dataset], _params: &Parameters) -> Result<()> {
        self.units.lock().push(ctx.available_units);
        Ok(())
    }

    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        Ok(vec![chunks[0].frame().to_owned()])
    }

    fn citation(&self) -> Option<Citation> {
        Some(Citation {
            description: "Observer stage".to_string(),
            doi: None,
        })
    }
}

/// Fails on one slice position.
struct FailAt(usize);

impl Stage for FailAt {
    fn name(&self) -> &str {
        "fail_at"
    }

    fn setup(&mut self, inputs: &[Dataset], _params: &Parameters) -> Result<StageSetup> {
        let input = &inputs[0];
        let pattern = input.get_pattern(FRAME)?.clone();
        Ok(StageSetup {
            inputs: vec![crate::stage::InputRequirement::new(FRAME)],
            outputs: vec![OutputSpec::new(input.name(), input.shape(), pattern)],
        })
    }

    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        if chunks[0].position == self.0 {
            return Err(PipelineError::ShapeMismatch {
                expected: vec![4, 4],
                actual: vec![0],
            });
        }
        Ok(vec![chunks[0].data.clone()])
    }
}

fn frame_source(shape: &[usize]) -> Dataset {
    let mut source = Dataset::from_array("d", ramp(shape));
    let core: Vec<usize> = (1..shape.len()).collect();
    source.declare_pattern(FRAME, &core, &[0]).unwrap();
    source
}

/// Runs a pipeline on a single worker with a recording transport.
fn run_single(
    stages: Vec<(Box<dyn Stage>, Map<String, Value>)>,
    source: Dataset,
    dir: &Path,
) -> (Result<Vec<Dataset>>, Vec<String>, RunContext, Arc<RawFileStore>) {
    let store = Arc::new(RawFileStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = RecordingTransport::new(store.clone(), log.clone());
    let ctx = RunContext::new(&RunConfig::with_workers(1, dir), 0).unwrap();
    let fleet = LocalCommunicator::fleet(1);

    let mut pipeline = Pipeline::new(stages, Box::new(transport));
    let result = pipeline.run(&ctx, &fleet[0], vec![source]);
    let events = log.lock().clone();
    (result, events, ctx, store)
}

fn write_source(dir: &Path, array: &ArrayD<f64>) -> SourceSpec {
    let path = dir.join("source.slfw");
    RawFileStore::write_array(&path, array).unwrap();
    let core: Vec<usize> = (1..array.ndim()).collect();
    SourceSpec::new("d", path).with_pattern(Pattern::new(FRAME, &core, &[0], array.ndim()).unwrap())
}

//==================================================================================
// Backing transitions
//==================================================================================

#[test]
fn test_final_stage_alone_switches_to_persistent() {
    let dir = tempfile::tempdir().unwrap();
    let stages = vec![
        stage(Scale::new(), json!({"factor": 2})),
        stage(Scale::new(), json!({"factor": 3})),
        stage(Scale::new(), json!({"factor": 4})),
    ];
    let (result, events, ctx, store) = run_single(stages, frame_source(&[4, 3]), dir.path());
    let outputs = result.unwrap();

    assert_eq!(
        events,
        vec![
            "pre_run",
            "pre_stage 0 InMemory",
            "post_stage 0",
            "pre_stage 1 InMemory",
            "post_stage 1",
            "pre_stage 2 Persistent",
            "post_stage 2",
            "post_run",
        ]
    );
    assert_eq!(outputs[0].backing(), Backing::Persistent);
    assert_eq!(store.open_count(), 0);

    let written = RawFileStore::read_array(&ctx.output_path("d")).unwrap();
    assert_close(&written, &ramp(&[4, 3]).mapv(|v| v * 24.0));
}

#[test]
fn test_single_stage_pipeline_prepares_and_finalises_around_it() {
    let dir = tempfile::tempdir().unwrap();
    let (result, events, ctx, _store) =
        run_single(vec![stage(Scale::new(), json!({}))], frame_source(&[2, 2]), dir.path());
    result.unwrap();

    assert_eq!(events, vec!["pre_run", "pre_stage 0 Persistent", "post_stage 0", "post_run"]);
    assert!(ctx.output_path("d").exists());
}

//==================================================================================
// Shapes, metadata and configuration
//==================================================================================

#[test]
fn test_downsampled_shape_reaches_next_stage() {
    crate::observability::init_logging("debug", None).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut source = Dataset::from_array("d", ramp(&[16]));
    source.declare_pattern(FRAME, &[0], &[]).unwrap();

    let observer = Observer::default();
    let seen = observer.input_shapes.clone();
    let stages = vec![stage(stages::Downsample::new(), json!({"factor": 2})), stage(observer, json!({}))];
    let (result, _events, ctx, _store) = run_single(stages, source, dir.path());

    let outputs = result.unwrap();
    assert_eq!(*seen.lock(), vec![vec![8]]);
    assert_eq!(outputs[0].shape(), &[8]);

    let written = RawFileStore::read_array(&ctx.output_path("d")).unwrap();
    let expected: Vec<f64> = (0..8).map(|k| 2.0 * k as f64 + 0.5).collect();
    assert_eq!(written.as_slice().unwrap(), expected.as_slice());
}

#[test]
fn test_metadata_and_previous_pattern_follow_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = frame_source(&[3, 2]);
    source
        .set_axis_labels(vec!["rotation_angle".into(), "detector_x".into()])
        .unwrap();
    source.set_meta("rotation_angle", json!([0.0, 60.0, 120.0]));
    source.set_meta("energy", json!(53.0));

    let observer = Observer::default();
    let store = Arc::new(RawFileStore::new());
    let ctx = RunContext::new(&RunConfig::with_workers(1, dir.path()), 0).unwrap();
    let fleet = LocalCommunicator::fleet(1);
    let mut pipeline = Pipeline::new(
        vec![stage(observer, json!({}))],
        Box::new(BasicTransport::new(store)),
    );
    let outputs = pipeline.run(&ctx, &fleet[0], vec![source]).unwrap();

    // The observer declares no axis labels, so the per-axis key is dropped.
    assert_eq!(outputs[0].get_meta("energy"), Some(&json!(53.0)));
    assert!(outputs[0].get_meta("rotation_angle").is_none());
    assert_eq!(outputs[0].previous_pattern().map(|p| p.name()), Some(FRAME));
    assert_eq!(pipeline.citations().len(), 1);
    assert_eq!(pipeline.stage_names(), vec!["observer"]);
}

#[test]
fn test_parameter_errors_abort_before_any_stage_runs() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::default();
    let seen = observer.input_shapes.clone();
    let stages = vec![stage(observer, json!({})), stage(Scale::new(), json!({"facter": 2}))];
    let (result, events, _ctx, _store) = run_single(stages, frame_source(&[2, 2]), dir.path());

    let err = result.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(matches!(
        err,
        PipelineError::StageFailed { ref stage, ref source }
            if stage == "scale" && matches!(**source, PipelineError::UnknownParameter { .. })
    ));
    assert!(seen.lock().is_empty());
    assert_eq!(events, vec!["abort_cleanup"]);
}

#[test]
fn test_mismatched_slice_counts_are_partition_errors() {
    struct Reslice;
    impl Stage for Reslice {
        fn name(&self) -> &str {
            "reslice"
        }
        fn setup(&mut self, inputs: &[Dataset], _params: &Parameters) -> Result<StageSetup> {
            let mut shape = inputs[0].shape().to_vec();
            shape[0] += 1;
            let pattern = inputs[0].get_pattern(FRAME)?.clone();
            Ok(StageSetup {
                inputs: vec![crate::stage::InputRequirement::new(FRAME)],
                outputs: vec![OutputSpec::new("grown", &shape, pattern)],
            })
        }
        fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
            Ok(vec![chunks[0].data.clone()])
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let (result, _events, _ctx, _store) =
        run_single(vec![stage(Reslice, json!({}))], frame_source(&[4, 2]), dir.path());
    assert_eq!(result.unwrap_err().class(), ErrorClass::Partition);
}

//==================================================================================
// Multi-worker runs
//==================================================================================

#[test]
fn test_three_workers_with_padding_match_serial_result() {
    let dir = tempfile::tempdir().unwrap();
    let source = ramp(&[10, 4, 4]);
    let spec = write_source(dir.path(), &source);
    let definition = PipelineDefinition::from_json_str(
        r#"{ "stages": [
            { "name": "scale", "params": { "factor": 2 } },
            { "name": "neighbour_mean", "params": { "width": 1 } },
            { "name": "downsample", "params": { "factor": 2 } }
        ] }"#,
    )
    .unwrap();

    let store: Arc<dyn BackingStore> = Arc::new(RawFileStore::new());
    let config = RunConfig::with_workers(3, dir.path().join("out"));
    let outputs = run_local(&config, &[spec], |_ctx| {
        Pipeline::from_definition(&definition, stages::by_name, Box::new(BasicTransport::new(store.clone())))
    })
    .unwrap();
    assert_eq!(outputs[0].shape(), &[10, 2, 2]);

    // Serial reference.
    let scaled = source.mapv(|v| v * 2.0).into_dimensionality::<Ix3>().unwrap();
    let mut expected = Array::zeros((10, 2, 2));
    for i in 0..10usize {
        let lo = i.saturating_sub(1);
        let hi = (i + 1).min(9);
        let mean = scaled.slice(s![lo..=hi, .., ..]).mean_axis(Axis(0)).unwrap();
        for (y, x) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            expected[[i, y, x]] = mean.slice(s![2 * y..2 * y + 2, 2 * x..2 * x + 2]).mean().unwrap();
        }
    }

    let written = RawFileStore::read_array(&config.output_dir.join("d.slfw")).unwrap();
    assert_close(&written, &expected.into_dyn());
}

#[test]
fn test_tuned_stage_writes_one_slab_per_value() {
    let dir = tempfile::tempdir().unwrap();
    let source = ramp(&[4, 3]);
    let spec = write_source(dir.path(), &source);
    let store: Arc<dyn BackingStore> = Arc::new(RawFileStore::new());
    let config = RunConfig::with_workers(2, dir.path().join("out"));

    let outputs = run_local(&config, &[spec], |_ctx| {
        Ok(Pipeline::new(
            vec![stage(Scale::new(), json!({"factor": "1;2;3"}))],
            Box::new(BasicTransport::new(store.clone())),
        ))
    })
    .unwrap();
    assert_eq!(outputs[0].shape(), &[3, 4, 3]);
    assert_eq!(outputs[0].get_pattern(FRAME).unwrap().slice_axes(), &[0, 1]);

    let written = RawFileStore::read_array(&config.output_dir.join("d.slfw")).unwrap();
    for k in 0..3 {
        let slab = written.index_axis(Axis(0), k).to_owned();
        assert_close(&slab, &source.mapv(|v| v * (k + 1) as f64));
    }
}

#[test]
fn test_class_and_leader_stages_cover_every_slice() {
    let dir = tempfile::tempdir().unwrap();
    let source = ramp(&[5, 2]);
    let spec = write_source(dir.path(), &source);
    let store: Arc<dyn BackingStore> = Arc::new(RawFileStore::new());
    let config = RunConfig {
        capability_tags: vec!["CPU0".into(), "GPU0".into(), "CPU1".into()],
        ..RunConfig::with_workers(3, dir.path().join("out"))
    };

    let leader = Observer {
        requirement: Some(Requirement::leader("CPU")),
        ..Observer::default()
    };
    let units = leader.units.clone();
    run_local(&config, &[spec], |_ctx| {
        Ok(Pipeline::new(
            vec![
                stage(Scale::on(Requirement::class("CPU")), json!({"factor": 3})),
                stage(leader.clone(), json!({})),
            ],
            Box::new(BasicTransport::new(store.clone())),
        ))
    })
    .unwrap();

    // Only CPU0 leads, with both CPU units available.
    assert_eq!(*units.lock(), vec![2]);
    let written = RawFileStore::read_array(&config.output_dir.join("d.slfw")).unwrap();
    assert_close(&written, &source.mapv(|v| v * 3.0));
}

#[test]
fn test_worker_failure_aborts_the_fleet() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_source(dir.path(), &ramp(&[10, 4, 4]));
    let store = Arc::new(RawFileStore::new());
    let shared: Arc<dyn BackingStore> = store.clone();
    let config = RunConfig::with_workers(3, dir.path().join("out"));

    let result = run_local(&config, &[spec], |_ctx| {
        Ok(Pipeline::new(
            vec![stage(FailAt(7), json!({})), stage(NeighbourMean::new(), json!({}))],
            Box::new(BasicTransport::new(shared.clone())),
        ))
    });

    let err = result.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Data);
    assert!(matches!(err, PipelineError::StageFailed { ref stage, .. } if stage == "fail_at"));
    assert_eq!(store.open_count(), 0);
    assert!(!config.output_dir.join("d.slfw").exists());
}

#[test]
fn test_output_named_like_its_source_fails_without_touching_it() {
    let dir = tempfile::tempdir().unwrap();
    let source = ramp(&[4, 3]);
    let path = dir.path().join("d.slfw");
    RawFileStore::write_array(&path, &source).unwrap();
    let spec = SourceSpec::new("d", &path).with_pattern(Pattern::new(FRAME, &[1], &[0], 2).unwrap());

    let store = Arc::new(RawFileStore::new());
    let shared: Arc<dyn BackingStore> = store.clone();
    let config = RunConfig::with_workers(2, dir.path());
    let result = run_local(&config, &[spec], |_ctx| {
        Ok(Pipeline::new(
            vec![stage(Scale::new(), json!({"factor": 2}))],
            Box::new(BasicTransport::new(shared.clone())),
        ))
    });

    assert_eq!(result.unwrap_err().class(), ErrorClass::BackingStore);
    assert_eq!(store.open_count(), 0);
    assert_close(&RawFileStore::read_array(&path).unwrap(), &source);
}

#[test]
fn test_pre_process_sees_the_whole_input() {
    /// Divides every frame by the largest value in the input.
    #[derive(Default)]
    struct Normalise {
        peak: f64,
    }

    impl Stage for Normalise {
        fn name(&self) -> &str {
            "normalise"
        }

        fn setup(&mut self, inputs: &[Dataset], _params: &Parameters) -> Result<StageSetup> {
            let input = &inputs[0];
            let pattern = input.get_pattern(FRAME)?.clone();
            Ok(StageSetup {
                inputs: vec![crate::stage::InputRequirement::new(FRAME)],
                outputs: vec![OutputSpec::new(input.name(), input.shape(), pattern)],
            })
        }

        fn pre_process(&mut self, _ctx: &StageContext, inputs: &[Dataset], _params: &Parameters) -> Result<()> {
            self.peak = inputs[0].to_array()?.fold(f64::MIN, |acc, &v| acc.max(v));
            Ok(())
        }

        fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
            Ok(vec![chunks[0].frame().mapv(|v| v / self.peak)])
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let source = ramp(&[4, 3]);
    let spec = write_source(dir.path(), &source);
    let store: Arc<dyn BackingStore> = Arc::new(RawFileStore::new());
    let config = RunConfig::with_workers(2, dir.path().join("out"));
    run_local(&config, &[spec], |_ctx| {
        Ok(Pipeline::new(
            vec![
                stage(Scale::new(), json!({"factor": 2})),
                stage(Normalise::default(), json!({})),
            ],
            Box::new(BasicTransport::new(store.clone())),
        ))
    })
    .unwrap();

    // Each worker only processes half the frames, yet both divide by the global peak.
    let written = RawFileStore::read_array(&config.output_dir.join("d.slfw")).unwrap();
    assert_close(&written, &source.mapv(|v| v / 11.0));
}
