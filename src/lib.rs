//! This crate orchestrates a two-sorter spike-sorting consensus pipeline for
//! electrophysiology recordings: it persists a preprocessed recording (with
//! bounded retries), runs two independent external sorters on it, discards
//! degenerate units, reconciles the two outputs into a consensus set of
//! units, and exports that set for manual curation.
//!
//! The signal processing and the sorting algorithms themselves live in
//! external tools behind the [`pipeline::Recording`] and
//! [`pipeline::SpikeSorter`] traits; this crate owns the bookkeeping around
//! them and the consensus computation.
//!
//! # Building a Consensus
//!
//! ```rust
//! use spikeline::consensus::{build_consensus, ConsensusParams};
//! use spikeline::sorting::{SorterResult, SpikeTrain, Unit};
//! use spikeline::template::TemplateSet;
//! use nalgebra::DMatrix;
//!
//! let a = SorterResult::build(
//!     "kilosort3",
//!     1,
//!     vec![Unit::build(1, vec![SpikeTrain::build(&[0.0, 0.5, 1.0]).unwrap()]).unwrap()],
//! )
//! .unwrap()
//! .retain_active_units();
//! let b = SorterResult::build(
//!     "kilosort2_5",
//!     1,
//!     vec![Unit::build(10, vec![SpikeTrain::build(&[0.02, 0.52, 1.01]).unwrap()]).unwrap()],
//! )
//! .unwrap()
//! .retain_active_units();
//!
//! let mut on_first = DMatrix::zeros(16, 2);
//! on_first[(4, 0)] = 3.0;
//! let mut on_second = DMatrix::zeros(16, 2);
//! on_second[(4, 1)] = 3.0;
//! let templates_a = TemplateSet::build("kilosort3", vec![(1, on_first)]).unwrap();
//! let templates_b = TemplateSet::build("kilosort2_5", vec![(10, on_second)]).unwrap();
//!
//! let consensus =
//!     build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default()).unwrap();
//! assert_eq!(consensus.num_units(), 1);
//! ```

use std::time::Duration;

pub mod config;
pub mod consensus;
pub mod error;
pub mod mirror;
pub mod persist;
pub mod pipeline;
pub mod sorting;
pub mod template;

/// The default tolerance window for two spikes from different sorters to
/// count as the same event.
pub const DEFAULT_DELTA_TIME: f64 = 0.2;
/// The default minimum fraction of matched spikes (relative to the union of
/// both trains) for two units to count as the same neuron. Empirical, open
/// to tuning.
pub const DEFAULT_MATCH_SCORE: f64 = 0.3;
/// The default minimum number of sorters that must agree on a unit.
pub const DEFAULT_MIN_AGREEMENT: usize = 2;
/// The default template-dissimilarity threshold below which an agreed pair
/// is judged to be one physical unit counted twice. Empirical, open to
/// tuning.
pub const DEFAULT_DUPLICATE_DISSIMILARITY: f64 = 0.9;
/// The default cap on recording-persist attempts.
pub const MAX_PERSIST_ATTEMPTS: usize = 4;
/// The default delay between recording-persist attempts.
pub const PERSIST_RETRY_DELAY: Duration = Duration::from_secs(5);
