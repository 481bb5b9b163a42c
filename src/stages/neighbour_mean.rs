use ndarray::{ArrayD, Axis};

use crate::data::{Chunk, Dataset};
use crate::error::{PipelineError, Result};
use crate::stage::{
    InputRequirement, OutputSpec, ParamSpec, ParamType, ParamValue, Parameters, Stage, StageContext, StageSetup,
};

/// Replaces every frame with the mean of itself and up to `width` neighbouring
/// frames on each side along the slice order. Needs padded input.
#[derive(Debug, Clone, Default)]
pub struct NeighbourMean {
    frames: usize,
    width: usize,
}

impl NeighbourMean {
    pub const NAME: &'static str = "neighbour_mean";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for NeighbourMean {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("width", ParamType::Int, ParamValue::Int(1), "Neighbours on each side."),
            super::pattern_param(),
        ]
    }

    fn setup(&mut self, inputs: &[Dataset], params: &Parameters) -> Result<StageSetup> {
        let (input, pattern) = super::primary_input(Self::NAME, inputs, params)?;
        self.width = params.get_usize("width")?;

        let mut output = OutputSpec::new(input.name(), input.shape(), pattern.clone());
        output.patterns.extend(super::inherited_patterns(input, &pattern));
        output.axis_labels = input.axis_labels().to_vec();

        Ok(StageSetup {
            inputs: vec![InputRequirement::new(pattern.name()).with_padding(self.width)],
            outputs: vec![output],
        })
    }

    fn pre_process(&mut self, _ctx: &StageContext, _inputs: &[Dataset], _params: &Parameters) -> Result<()> {
        self.frames = 0;
        Ok(())
    }

    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        let chunk = chunks.first().ok_or_else(|| PipelineError::DatasetCountMismatch {
            stage: Self::NAME.to_string(),
            required: 1,
            available: 0,
        })?;
        self.frames += 1;

        let mean = match chunk.centre {
            Some(_) => chunk.data.mean_axis(Axis(0)),
            None => Some(chunk.data.clone()),
        };
        let mean = mean.ok_or_else(|| PipelineError::ShapeMismatch {
            expected: vec![1],
            actual: vec![0],
        })?;
        Ok(vec![mean])
    }

    fn executive_summary(&self) -> Vec<String> {
        vec![format!(
            "Averaged {} frame(s) over a window of +/-{}",
            self.frames, self.width
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_mean_over_stacked_neighbourhood() {
        let mut stage = NeighbourMean::new();
        let data = ArrayD::from_shape_vec(IxDyn(&[3, 2]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let chunk = Chunk {
            data,
            index: vec![1],
            position: 1,
            centre: Some(1),
        };
        let out = stage.process_chunk(&[chunk]).unwrap();
        assert_eq!(out[0].as_slice().unwrap(), &[3.0, 4.0]);
        assert!(stage.executive_summary()[0].contains("1 frame"));
    }
}
