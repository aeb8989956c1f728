//! Module implementing the stage orchestration of a pipeline run.
//!
//! The pipeline is a single sequential control flow over a working folder
//! with one fixed-named subfolder per stage: the persisted recording, one
//! folder per sorter, and the consensus output. Each subfolder is reset
//! destructively at the start of its stage. All heavy computation (filtering,
//! sorting) happens inside the external collaborators behind the
//! [`Recording`] and [`SpikeSorter`] traits; this module only sequences them
//! and accounts for the disk-hungry intermediates they leave behind.
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::consensus::{build_consensus, ConsensusSet};
use crate::error::SpikelineError;
use crate::persist::{reset_folder, RetryPolicy};
use crate::sorting::SorterResult;
use crate::template::TemplateSet;

/// Stage folder of the persisted recording inside the working folder.
pub const RECORDING_FOLDER: &str = "recording_save";
/// Stage folder of the consensus output inside the working folder.
pub const CONSENSUS_FOLDER: &str = "consensus";
/// File name of the exported consensus artifact.
pub const CONSENSUS_FILE: &str = "consensus.json";

/// A preprocessed recording that can be materialized to durable storage.
/// Implementers wrap the external signal-processing chain (band-pass filter,
/// re-referencing, binary save).
pub trait Recording {
    /// Materialize the recording into the given (freshly reset) folder.
    /// Failures reported as transient are retried by the pipeline.
    fn persist_to(&self, folder: &Path, n_jobs: Option<usize>) -> Result<(), SpikelineError>;
}

/// An external spike-sorting service.
pub trait SpikeSorter {
    /// The name of the sorting algorithm, also used as its stage folder name.
    fn name(&self) -> &str;

    /// Check that the sorter is actually installed. Called before any stage
    /// runs, so a bad installation path fails the run up front.
    fn check_installation(&self) -> Result<(), SpikelineError> {
        Ok(())
    }

    /// Sort the persisted recording, leaving the sorter's artifacts under the
    /// output folder, and report the detected units.
    fn run(
        &self,
        recording_folder: &Path,
        output_folder: &Path,
        n_jobs: Option<usize>,
    ) -> Result<SorterResult, SpikelineError>;

    /// The waveform templates of the completed run, read back from the
    /// sorter's output folder.
    fn templates(&self, output_folder: &Path) -> Result<TemplateSet, SpikelineError>;
}

/// A two-sorter consensus pipeline over a working folder.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    retry: RetryPolicy,
}

impl Pipeline {
    /// Create a pipeline with the specified configuration and persist-retry
    /// policy. The configuration is validated up front.
    pub fn build(config: PipelineConfig, retry: RetryPolicy) -> Result<Self, SpikelineError> {
        config.validate()?;
        Ok(Pipeline { config, retry })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the whole pipeline: persist the recording, run both sorters, drop
    /// degenerate units, build the consensus, and export it to the output
    /// folder. On normal completion the working folder is removed; a failure
    /// partway through leaves the intermediate stage folders behind.
    pub fn run<R: Recording>(
        &self,
        recording: &R,
        sorter_a: &dyn SpikeSorter,
        sorter_b: &dyn SpikeSorter,
    ) -> Result<ConsensusSet, SpikelineError> {
        if sorter_a.name() == sorter_b.name() {
            return Err(SpikelineError::Configuration(format!(
                "Both sorters are named {}; their stage folders would collide",
                sorter_a.name()
            )));
        }
        sorter_a.check_installation()?;
        sorter_b.check_installation()?;

        let working = &self.config.working_folder;
        fs::create_dir_all(working)?;

        let recording_folder = working.join(RECORDING_FOLDER);
        self.retry.persist(&recording_folder, |folder| {
            recording.persist_to(folder, self.config.n_jobs)
        })?;
        self.log_stage("recording persisted");

        let result_a = self.run_sorter(sorter_a, &recording_folder)?;
        let result_b = self.run_sorter(sorter_b, &recording_folder)?;

        let templates_a = sorter_a.templates(&working.join(sorter_a.name()))?;
        let templates_b = sorter_b.templates(&working.join(sorter_b.name()))?;

        log::info!("Starting consensus...");
        let consensus = build_consensus(
            &result_a,
            &result_b,
            &templates_a,
            &templates_b,
            &self.config.consensus,
        )?;
        let consensus_folder = working.join(CONSENSUS_FOLDER);
        reset_folder(&consensus_folder)?;
        consensus.save_to(consensus_folder.join(CONSENSUS_FILE))?;
        self.log_stage("consensus built");

        reset_folder(&self.config.output_folder)?;
        consensus.save_to(self.config.output_folder.join(CONSENSUS_FILE))?;
        self.log_stage("consensus exported");

        log::info!("Removing intermediate data folders");
        // Leftovers here are harmless and the artifact is already exported
        let _ = fs::remove_dir_all(working);

        Ok(consensus)
    }

    fn run_sorter(
        &self,
        sorter: &dyn SpikeSorter,
        recording_folder: &Path,
    ) -> Result<SorterResult, SpikelineError> {
        let output_folder = self.config.working_folder.join(sorter.name());
        reset_folder(&output_folder)?;

        log::info!("Starting {}...", sorter.name());
        let result = sorter.run(recording_folder, &output_folder, self.config.n_jobs)?;

        let filtered = result.retain_active_units();
        log::info!(
            "{} reported {} units, {} retained after the unit filter",
            sorter.name(),
            result.num_units(),
            filtered.num_units()
        );
        self.log_stage(sorter.name());
        Ok(filtered)
    }

    fn log_stage(&self, stage: &str) {
        let footprint = folder_footprint(&self.config.working_folder);
        log::info!(
            "Stage complete: {} (working folder footprint: {:.1} MiB)",
            stage,
            footprint as f64 / (1 << 20) as f64
        );
    }
}

/// Total size in bytes of all files under a folder. Unreadable entries are
/// skipped; this feeds progress logging only.
pub fn folder_footprint<P: AsRef<Path>>(path: P) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}
