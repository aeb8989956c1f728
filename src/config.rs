//! Module implementing the pipeline configuration.
//!
//! External tool locations are explicit values handed to constructors, not
//! process-wide environment state, so two pipelines with different sorter
//! installations can coexist and a bad path surfaces before any stage runs.
use serde::{Deserialize, Serialize};
use serde_json;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::consensus::ConsensusParams;
use crate::error::SpikelineError;

/// The configuration of one external sorting tool.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    /// The name of the sorting algorithm, also used as its stage folder name.
    pub name: String,
    /// The installation path of the sorter.
    pub executable: PathBuf,
    /// Whether to keep only the units the sorter itself labels as good.
    pub keep_good_only: bool,
}

impl SorterConfig {
    pub fn new(name: &str, executable: PathBuf, keep_good_only: bool) -> Self {
        SorterConfig {
            name: name.to_string(),
            executable,
            keep_good_only,
        }
    }

    /// Check that the configured installation actually exists.
    pub fn validate(&self) -> Result<(), SpikelineError> {
        if self.name.is_empty() {
            return Err(SpikelineError::Configuration(
                "Sorter name must not be empty".to_string(),
            ));
        }
        if !self.executable.exists() {
            return Err(SpikelineError::Configuration(format!(
                "Sorter {} not found at {}",
                self.name,
                self.executable.display()
            )));
        }
        Ok(())
    }
}

/// The configuration of a pipeline run.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Where intermediate stage folders live; removed on normal completion.
    pub working_folder: PathBuf,
    /// Where the consensus artifact is exported; survives cleanup.
    pub output_folder: PathBuf,
    /// Worker slots handed through to the external services; `None` means
    /// all available.
    pub n_jobs: Option<usize>,
    /// The external sorting tools of this run, checked before any stage runs.
    pub sorters: Vec<SorterConfig>,
    /// Tuning parameters of the consensus computation.
    pub consensus: ConsensusParams,
}

impl PipelineConfig {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(working_folder: P, output_folder: Q) -> Self {
        PipelineConfig {
            working_folder: working_folder.as_ref().to_path_buf(),
            output_folder: output_folder.as_ref().to_path_buf(),
            n_jobs: None,
            sorters: Vec::new(),
            consensus: ConsensusParams::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SpikelineError> {
        if self.output_folder.starts_with(&self.working_folder) {
            return Err(SpikelineError::Configuration(format!(
                "Output folder {} would be removed with the working folder",
                self.output_folder.display()
            )));
        }
        if self.n_jobs == Some(0) {
            return Err(SpikelineError::Configuration(
                "Worker slot count must be at least one".to_string(),
            ));
        }
        for (i, sorter) in self.sorters.iter().enumerate() {
            sorter.validate()?;
            if self.sorters[..i].iter().any(|other| other.name == sorter.name) {
                return Err(SpikelineError::Configuration(format!(
                    "Sorter {} is configured twice; stage folders would collide",
                    sorter.name
                )));
            }
        }
        self.consensus.validate()
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> std::io::Result<PipelineConfig> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
