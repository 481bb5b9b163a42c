//! Reference stages shipped with the engine.
//!
//! They are deliberately small numeric transforms. Real pipelines plug in their own
//! [`Stage`] implementations; these exist so a pipeline definition can be run end
//! to end and so the engine's behaviour (shape changes, padding, tuning) is
//! exercised by real stages.

use crate::data::{Dataset, Pattern};
use crate::error::{PipelineError, Result};
use crate::stage::{ParamSpec, ParamType, ParamValue, Parameters, Stage};

//==================================================================================
// 1. Module Declarations
//==================================================================================
mod downsample;
mod neighbour_mean;
mod scale;

//==================================================================================
// 2. Public API Re-exports
//==================================================================================
pub use self::downsample::Downsample;
pub use self::neighbour_mean::NeighbourMean;
pub use self::scale::Scale;

/// Builds a reference stage from its registered name.
pub fn by_name(name: &str) -> Option<Box<dyn Stage>> {
    match name {
        Scale::NAME => Some(Box::new(Scale::new())),
        Downsample::NAME => Some(Box::new(Downsample::new())),
        NeighbourMean::NAME => Some(Box::new(NeighbourMean::new())),
        _ => None,
    }
}

/// The `pattern` parameter every reference stage takes.
pub(crate) fn pattern_param() -> ParamSpec {
    ParamSpec::new(
        "pattern",
        ParamType::Str,
        ParamValue::Str(crate::data::pattern::names::FRAME.to_string()),
        "The pattern the input is processed under.",
    )
    .fixed()
}

/// The first input and the pattern named by the `pattern` parameter.
pub(crate) fn primary_input<'a>(
    stage: &str,
    inputs: &'a [Dataset],
    params: &Parameters,
) -> Result<(&'a Dataset, Pattern)> {
    let input = inputs.first().ok_or_else(|| PipelineError::DatasetCountMismatch {
        stage: stage.to_string(),
        required: 1,
        available: 0,
    })?;
    let pattern = input.get_pattern(params.get_str("pattern")?)?.clone();
    Ok((input, pattern))
}

/// Every pattern declared on `input`, for an output of the same dimensionality.
pub(crate) fn inherited_patterns(input: &Dataset, write: &Pattern) -> Vec<Pattern> {
    input
        .patterns()
        .names()
        .filter(|name| *name != write.name())
        .filter_map(|name| input.get_pattern(name).ok().cloned())
        .collect()
}
