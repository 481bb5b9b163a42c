use ndarray::ArrayD;

use crate::data::{Chunk, Dataset};
use crate::error::Result;
use crate::runtime::dispatch::Requirement;
use crate::stage::{
    InputRequirement, OutputSpec, ParamSpec, ParamType, ParamValue, Parameters, Stage, StageContext, StageSetup,
};

/// Multiplies every element by `factor`. The factor can be tuned.
#[derive(Debug, Clone)]
pub struct Scale {
    factor: f64,
    requirement: Requirement,
}

impl Scale {
    pub const NAME: &'static str = "scale";

    pub fn new() -> Self {
        Self {
            factor: 1.0,
            requirement: Requirement::Any,
        }
    }

    /// A scale stage that only runs on workers of `requirement`.
    pub fn on(requirement: Requirement) -> Self {
        Self {
            requirement,
            ..Self::new()
        }
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Scale {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("factor", ParamType::Float, ParamValue::Float(1.0), "Multiplier."),
            super::pattern_param(),
        ]
    }

    fn requirement(&self) -> Requirement {
        self.requirement.clone()
    }

    fn setup(&mut self, inputs: &[Dataset], params: &Parameters) -> Result<StageSetup> {
        let (input, pattern) = super::primary_input(Self::NAME, inputs, params)?;
        let mut output = OutputSpec::new(input.name(), input.shape(), pattern.clone());
        output.patterns.extend(super::inherited_patterns(input, &pattern));
        output.axis_labels = input.axis_labels().to_vec();

        Ok(StageSetup {
            inputs: vec![InputRequirement::new(pattern.name())],
            outputs: vec![output],
        })
    }

    fn pre_process(&mut self, _ctx: &StageContext, _inputs: &[Dataset], params: &Parameters) -> Result<()> {
        self.factor = params.get_f64("factor")?;
        Ok(())
    }

    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        Ok(chunks.iter().map(|chunk| chunk.frame().mapv(|v| v * self.factor)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Backing;
    use crate::stage::params::bind;
    use ndarray::IxDyn;
    use serde_json::json;

    fn ctx() -> StageContext {
        StageContext {
            rank: 0,
            size: 1,
            available_units: 1,
            stage_index: 0,
            run: 0,
            tuning_index: vec![],
            backing: Backing::InMemory,
        }
    }

    #[test]
    fn test_setup_keeps_shape_labels_and_patterns() {
        let mut input = Dataset::in_memory("d", &[3, 4]);
        input.declare_pattern("FRAME", &[1], &[0]).unwrap();
        input.declare_pattern("SPECTRUM", &[0], &[1]).unwrap();
        input.set_axis_labels(vec!["angle".into(), "x".into()]).unwrap();

        let mut stage = Scale::new();
        let params = bind(Scale::NAME, &stage.parameters(), &serde_json::Map::new()).unwrap();
        let setup = stage.setup(&[input], &params).unwrap();

        let output = &setup.outputs[0];
        assert_eq!(output.shape, vec![3, 4]);
        assert_eq!(output.write_pattern, "FRAME");
        assert_eq!(output.axis_labels, vec!["angle".to_string(), "x".to_string()]);
        assert!(output.patterns.iter().any(|p| p.name() == "SPECTRUM"));
        assert_eq!(setup.inputs[0].pattern, "FRAME");
    }

    #[test]
    fn test_each_tuning_run_applies_its_factor() {
        let mut stage = Scale::new();
        let raw = json!({"factor": "0.5;3"}).as_object().cloned().unwrap();
        let params = bind(Scale::NAME, &stage.parameters(), &raw).unwrap();
        let chunk = Chunk {
            data: ArrayD::from_shape_vec(IxDyn(&[2]), vec![2.0, -4.0]).unwrap(),
            index: vec![0],
            position: 0,
            centre: None,
        };

        let mut outputs = Vec::new();
        for run in 0..params.run_count() {
            stage.pre_process(&ctx(), &[], &params.for_run(run).unwrap()).unwrap();
            outputs.push(stage.process_chunk(&[chunk.clone()]).unwrap().remove(0));
        }
        assert_eq!(outputs[0].as_slice().unwrap(), &[1.0, -2.0]);
        assert_eq!(outputs[1].as_slice().unwrap(), &[6.0, -12.0]);
    }

    #[test]
    fn test_requirement_is_configurable() {
        assert_eq!(Scale::new().requirement(), Requirement::Any);
        assert_eq!(Scale::on(Requirement::class("GPU")).requirement(), Requirement::class("GPU"));
    }
}
