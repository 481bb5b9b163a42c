// In: src/runtime/context.rs

//! The explicit, read-only context every worker carries through a run.

use std::path::{Path, PathBuf};

use crate::config::RunConfig;
use crate::data::Backing;
use crate::error::{PipelineError, Result};

/// Who this worker is and where the pipeline currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub rank: usize,
    pub size: usize,
    /// This worker's capability tag.
    pub tag: String,
    /// Every worker's capability tag, in rank order.
    pub capability_tags: Vec<String>,
    pub stage_index: usize,
    pub n_stages: usize,
    /// The backing new outputs are created with.
    pub backing: Backing,
    pub output_dir: PathBuf,
    pub chunking_hint: usize,
    pub keep_sources_open: bool,
}

impl RunContext {
    /// The context of worker `rank` for a validated configuration.
    pub fn new(config: &RunConfig, rank: usize) -> Result<Self> {
        config.validate()?;
        let capability_tags = config.resolved_tags();
        let tag = capability_tags.get(rank).cloned().ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "worker {} is outside a fleet of {}",
                rank, config.workers
            ))
        })?;
        Ok(Self {
            rank,
            size: config.workers,
            tag,
            capability_tags,
            stage_index: 0,
            n_stages: 0,
            backing: Backing::InMemory,
            output_dir: config.output_dir.clone(),
            chunking_hint: config.chunking_hint,
            keep_sources_open: config.keep_sources_open,
        })
    }

    /// A copy for stage `index` of `n_stages`, creating outputs with `backing`.
    pub fn for_stage(&self, index: usize, n_stages: usize, backing: Backing) -> Self {
        Self {
            stage_index: index,
            n_stages,
            backing,
            ..self.clone()
        }
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn is_final_stage(&self) -> bool {
        self.n_stages > 0 && self.stage_index == self.n_stages - 1
    }

    /// Where the final output dataset `name` is stored.
    pub fn output_path(&self, name: &str) -> PathBuf {
        output_path(&self.output_dir, name)
    }
}

pub(crate) fn output_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.slfw", name))
}
