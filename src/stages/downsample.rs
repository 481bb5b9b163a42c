use ndarray::{ArrayD, IxDyn};

use crate::data::{Chunk, Dataset};
use crate::error::{PipelineError, Result};
use crate::stage::{
    InputRequirement, OutputSpec, ParamSpec, ParamType, ParamValue, Parameters, Stage, StageContext, StageSetup,
};

/// Bins every core axis by `factor`, replacing each block with its mean. A
/// trailing partial block is dropped, so an axis of length `n` becomes `n / factor`.
#[derive(Debug, Clone, Default)]
pub struct Downsample {
    factor: usize,
}

impl Downsample {
    pub const NAME: &'static str = "downsample";

    pub fn new() -> Self {
        Self { factor: 2 }
    }
}

fn factor(params: &Parameters) -> Result<usize> {
    match params.get_usize("factor")? {
        0 => Err(PipelineError::TypeMismatch {
            name: "factor".to_string(),
            expected: "a positive integer".to_string(),
            value: "0".to_string(),
        }),
        f => Ok(f),
    }
}

impl Stage for Downsample {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("factor", ParamType::Int, ParamValue::Int(2), "Bin width along every core axis.").fixed(),
            super::pattern_param(),
        ]
    }

    fn setup(&mut self, inputs: &[Dataset], params: &Parameters) -> Result<StageSetup> {
        let (input, pattern) = super::primary_input(Self::NAME, inputs, params)?;
        let factor = factor(params)?;

        let mut shape = input.shape().to_vec();
        for &axis in pattern.core_axes() {
            shape[axis] /= factor;
        }
        // Binning keeps every axis, so the input's patterns stay valid.
        let mut output = OutputSpec::new(input.name(), &shape, pattern.clone());
        output.patterns.extend(super::inherited_patterns(input, &pattern));
        output.axis_labels = input.axis_labels().to_vec();

        Ok(StageSetup {
            inputs: vec![InputRequirement::new(pattern.name())],
            outputs: vec![output],
        })
    }

    fn pre_process(&mut self, _ctx: &StageContext, _inputs: &[Dataset], params: &Parameters) -> Result<()> {
        self.factor = factor(params)?;
        Ok(())
    }

    fn process_chunk(&mut self, chunks: &[Chunk]) -> Result<Vec<ArrayD<f64>>> {
        let f = self.factor;
        Ok(chunks
            .iter()
            .map(|chunk| {
                let frame = chunk.frame();
                let out_shape: Vec<usize> = frame.shape().iter().map(|&n| n / f).collect();
                let block: Vec<usize> = vec![f; out_shape.len()];
                let block_len = block.iter().product::<usize>() as f64;

                ArrayD::from_shape_fn(IxDyn(&out_shape), |out| {
                    let sum: f64 = ndarray::indices(IxDyn(&block))
                        .into_iter()
                        .map(|offset| {
                            let src: Vec<usize> = (0..out_shape.len())
                                .map(|k| out[k] * f + offset[k])
                                .collect();
                            frame[IxDyn(&src)]
                        })
                        .sum();
                    sum / block_len
                })
            })
            .collect())
    }
}
