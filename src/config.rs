// In: src/config.rs

//! The single source of truth for run configuration.
//!
//! `RunConfig` is created once at the application boundary (from a JSON file or
//! built in code) and turned into the read-only `RunContext` each worker carries.
//! `PipelineDefinition` is the fully resolved stage list produced by an external
//! plugin-list loader: stage name plus a parameter map per stage.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

//==================================================================================
// I. Run Configuration
//==================================================================================

/// The single, unified configuration of a pipeline run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// The fixed number of cooperating workers. Never changes during a run.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// One capability tag per worker slot (e.g. `"CPU0"`, `"CPU1"`, `"GPU0"`).
    /// Empty means every slot is tagged `"CPU<n>"`.
    #[serde(default)]
    pub capability_tags: Vec<String>,

    /// Directory the final stage's persistent outputs are created in.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// If true, source stores stay open for reading until the end of the run.
    #[serde(default = "default_true")]
    pub keep_sources_open: bool,

    /// Preferred number of slice positions per physical chunk, forwarded to the
    /// backing store as a layout hint when creating outputs.
    #[serde(default = "default_chunking_hint")]
    pub chunking_hint: usize,

    /// Log level `run_local` installs the process logger with.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            capability_tags: Vec::new(),
            output_dir: default_output_dir(),
            keep_sources_open: true,
            chunking_hint: default_chunking_hint(),
            log_level: default_log_level(),
        }
    }
}

impl RunConfig {
    /// A config for `workers` CPU workers writing into `output_dir`.
    pub fn with_workers(workers: usize, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            workers,
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Parses a config from JSON, applying defaults for missing fields.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The effective capability tag of every worker slot.
    pub fn resolved_tags(&self) -> Vec<String> {
        if self.capability_tags.is_empty() {
            (0..self.workers).map(|i| format!("CPU{}", i)).collect()
        } else {
            self.capability_tags.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if !self.capability_tags.is_empty() && self.capability_tags.len() != self.workers {
            return Err(PipelineError::InvalidConfig(format!(
                "{} capability tags given for {} workers",
                self.capability_tags.len(),
                self.workers
            )));
        }
        if self.chunking_hint == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunking_hint must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

//==================================================================================
// II. Pipeline Definition
//==================================================================================

/// One resolved entry of a plugin list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageEntry {
    /// The stage's registered name.
    pub name: String,
    /// Parameter name -> raw value. Coerced against the stage's schema at bind time.
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// The ordered list of stages to run, as handed over by the pipeline-definition loader.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PipelineDefinition {
    pub stages: Vec<StageEntry>,
}

impl PipelineDefinition {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The parameter map of the stage at `index`, or an empty map.
    pub fn params_for(&self, index: usize) -> Map<String, Value> {
        self.stages
            .get(index)
            .map(|entry| entry.params.clone())
            .unwrap_or_default()
    }
}

/// Helper for `serde` to default a boolean field to true.
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_chunking_hint() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}
