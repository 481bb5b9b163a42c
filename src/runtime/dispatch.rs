// In: src/runtime/dispatch.rs

//! The worker dispatcher: decides, from a worker's capability tag alone, whether it
//! takes part in a stage and with which class-local rank.
//!
//! Every worker evaluates `assign` independently and reaches the same answer for
//! the whole fleet, so no coordination is needed.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// The kind of worker a stage needs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Every worker runs the stage.
    Any,
    /// Only workers of a capability class run the stage, re-ranked within the class.
    Class(String),
    /// A single worker (tag `<class>0`) runs the stage and may use every unit of
    /// the class.
    Leader(String),
}

impl Requirement {
    pub fn class(name: &str) -> Self {
        Requirement::Class(name.to_string())
    }

    pub fn leader(name: &str) -> Self {
        Requirement::Leader(name.to_string())
    }
}

/// The dispatcher's verdict for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    Run {
        /// Rank among the participating workers.
        rank: usize,
        /// Number of participating workers.
        size: usize,
        /// Compute units this worker may use.
        available_units: usize,
    },
    Skip,
}

impl RunDecision {
    pub fn runs(&self) -> bool {
        matches!(self, RunDecision::Run { .. })
    }
}

/// True when `tag` belongs to capability class `class`: it is the class name
/// itself or the class name followed only by digits (`CPU3` is in `CPU`).
pub fn in_class(tag: &str, class: &str) -> bool {
    tag.strip_prefix(class)
        .is_some_and(|suffix| suffix.chars().all(|c| c.is_ascii_digit()))
}

pub fn assign(
    worker_id: usize,
    worker_count: usize,
    capability_tags: &[String],
    requirement: &Requirement,
) -> Result<RunDecision> {
    if capability_tags.len() != worker_count {
        return Err(PipelineError::Partition(format!(
            "{} capability tags for {} workers",
            capability_tags.len(),
            worker_count
        )));
    }
    if worker_id >= worker_count {
        return Err(PipelineError::Partition(format!(
            "worker {} is outside a fleet of {}",
            worker_id, worker_count
        )));
    }

    let decision = match requirement {
        Requirement::Any => RunDecision::Run {
            rank: worker_id,
            size: worker_count,
            available_units: 1,
        },
        Requirement::Class(class) => class_rank(worker_id, capability_tags, |tag| in_class(tag, class))
            .map_or(RunDecision::Skip, |(rank, size)| RunDecision::Run {
                rank,
                size,
                available_units: 1,
            }),
        Requirement::Leader(class) => {
            let leader_tag = format!("{}0", class);
            let units = capability_tags.iter().filter(|tag| in_class(tag, class)).count();
            class_rank(worker_id, capability_tags, |tag| tag == leader_tag).map_or(
                RunDecision::Skip,
                |(rank, size)| RunDecision::Run {
                    rank,
                    size,
                    available_units: units,
                },
            )
        }
    };
    Ok(decision)
}

/// The rank of `worker_id` among the slots matching `member`, and the number of
/// matching slots, or `None` if the worker does not match.
fn class_rank<F>(worker_id: usize, tags: &[String], member: F) -> Option<(usize, usize)>
where
    F: Fn(&str) -> bool,
{
    if !member(tags[worker_id].as_str()) {
        return None;
    }
    let rank = tags[..worker_id].iter().filter(|tag| member(tag.as_str())).count();
    let size = tags.iter().filter(|tag| member(tag.as_str())).count();
    Some((rank, size))
}
