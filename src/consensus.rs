//! Module implementing the multi-sorter consensus: matching units across two
//! independent sorter runs by spike-train agreement, then discarding agreed
//! pairs whose waveform templates are near-duplicates of each other.
//!
//! # Examples
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
//! .unwrap();
//! let b = SorterResult::build(
//!     "kilosort2_5",
//!     1,
//!     vec![Unit::build(10, vec![SpikeTrain::build(&[0.02, 0.52, 1.01]).unwrap()]).unwrap()],
//! )
//! .unwrap();
//!
//! // Distinct channel signatures, so the duplicate filter keeps the pair
//! let mut on_first = DMatrix::zeros(4, 2);
//! on_first[(0, 0)] = 1.0;
//! let mut on_second = DMatrix::zeros(4, 2);
//! on_second[(0, 1)] = 1.0;
//! let templates_a = TemplateSet::build("kilosort3", vec![(1, on_first)]).unwrap();
//! let templates_b = TemplateSet::build("kilosort2_5", vec![(10, on_second)]).unwrap();
//!
//! let consensus =
//!     build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default()).unwrap();
//! assert_eq!(consensus.num_units(), 1);
//! ```
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::SpikelineError;
use crate::sorting::{SorterResult, Unit};
use crate::template::TemplateSet;
use crate::{
    DEFAULT_DELTA_TIME, DEFAULT_DUPLICATE_DISSIMILARITY, DEFAULT_MATCH_SCORE,
    DEFAULT_MIN_AGREEMENT,
};

/// Minimum number of unit pairs to parallelize the matching scan.
pub const MIN_PAIRS_PAR: usize = 256;

/// Tuning parameters of the consensus computation. The defaults are empirical
/// constants carried over from production use, not calibrated guarantees.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Two spikes from different sorters closer than this are the same event.
    pub delta_time: f64,
    /// Minimum fraction of matched spikes (relative to the union of both
    /// trains) for two units to be candidates for the same neuron.
    pub match_score: f64,
    /// Minimum number of sorters that must agree on a unit. With two sorters
    /// compared, only 2 is meaningful (no partial credit).
    pub min_agreement: usize,
    /// Agreed pairs whose template dissimilarity falls below this are judged
    /// to be one physical unit counted twice, and dropped.
    pub duplicate_dissimilarity: f64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            delta_time: DEFAULT_DELTA_TIME,
            match_score: DEFAULT_MATCH_SCORE,
            min_agreement: DEFAULT_MIN_AGREEMENT,
            duplicate_dissimilarity: DEFAULT_DUPLICATE_DISSIMILARITY,
        }
    }
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), SpikelineError> {
        if !self.delta_time.is_finite() || self.delta_time < 0.0 {
            return Err(SpikelineError::InvalidParameter(format!(
                "Tolerance window must be non-negative, got {}",
                self.delta_time
            )));
        }
        if !self.match_score.is_finite() || self.match_score <= 0.0 || self.match_score > 1.0 {
            return Err(SpikelineError::InvalidParameter(format!(
                "Match score must be in (0, 1], got {}",
                self.match_score
            )));
        }
        if self.min_agreement == 0 || self.min_agreement > 2 {
            return Err(SpikelineError::InvalidParameter(format!(
                "Minimum agreement must be 1 or 2 with two sorters compared, got {}",
                self.min_agreement
            )));
        }
        if !(0.0..=1.0).contains(&self.duplicate_dissimilarity) {
            return Err(SpikelineError::InvalidParameter(format!(
                "Duplicate dissimilarity threshold must be in [0, 1], got {}",
                self.duplicate_dissimilarity
            )));
        }
        Ok(())
    }
}

/// A pair of units, one per sorter, judged to be the same physical neuron.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct AgreementUnit {
    /// The id of the unit in the first sorter's result.
    pub unit_a: usize,
    /// The id of the unit in the second sorter's result.
    pub unit_b: usize,
    /// The spike-train match score of the pair.
    pub score: f64,
    /// How many sorters voted for the unit.
    pub agreement_count: usize,
}

/// The final consensus artifact: the agreed units surviving both the
/// minimum-agreement threshold and the duplicate-template filter.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConsensusSet {
    sorter_a: String,
    sorter_b: String,
    units: Vec<AgreementUnit>,
    num_duplicates_removed: usize,
}

impl ConsensusSet {
    /// Returns the names of the two contributing sorters.
    pub fn sorters(&self) -> (&str, &str) {
        (&self.sorter_a, &self.sorter_b)
    }

    /// An iterator over the surviving agreement units.
    pub fn units_iter(&self) -> impl Iterator<Item = &AgreementUnit> + '_ {
        self.units.iter()
    }

    /// The number of surviving agreement units.
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// How many agreed units the duplicate-template filter removed.
    pub fn num_duplicates_removed(&self) -> usize {
        self.num_duplicates_removed
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> std::io::Result<ConsensusSet> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// Count the spike pairs of two sorted trains falling within the tolerance
/// window, each spike consumed at most once (two-pointer sweep).
fn count_matched_spikes(a: &[f64], b: &[f64], delta_time: f64) -> usize {
    let mut matches = 0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if (a[i] - b[j]).abs() <= delta_time {
            matches += 1;
            i += 1;
            j += 1;
        } else if a[i] < b[j] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matches
}

/// The union-based match score of two units: matched spike pairs over the
/// size of the union of both spike trains, accumulated across segments.
fn unit_match_score(unit_a: &Unit, unit_b: &Unit, delta_time: f64) -> f64 {
    let mut matches = 0;
    let mut num_a = 0;
    let mut num_b = 0;

    for (train_a, train_b) in unit_a.trains_iter().zip_eq(unit_b.trains_iter()) {
        matches += count_matched_spikes(train_a.times(), train_b.times(), delta_time);
        num_a += train_a.num_spikes();
        num_b += train_b.num_spikes();
    }

    let union = num_a + num_b - matches;
    if union == 0 {
        0.0
    } else {
        matches as f64 / union as f64
    }
}

/// Build the consensus of two unit-filtered sorter results.
///
/// Every (unit in A, unit in B) pair is scored by spike-train agreement;
/// pairs at or above the match-score threshold are resolved into one-to-one
/// assignments greedily, best score first (ties broken by ascending unit ids,
/// so the assignment is deterministic). Assigned pairs carry an agreement
/// count of 2 and must meet the minimum-agreement threshold. Finally, pairs
/// whose waveform templates are near-duplicates are dropped: near-identical
/// channel signatures from two sorters are one physical unit counted twice.
///
/// Empty inputs yield an empty consensus, not an error. Missing or malformed
/// templates are fatal.
pub fn build_consensus(
    a: &SorterResult,
    b: &SorterResult,
    templates_a: &TemplateSet,
    templates_b: &TemplateSet,
    params: &ConsensusParams,
) -> Result<ConsensusSet, SpikelineError> {
    params.validate()?;

    if a.num_segments() != b.num_segments() {
        return Err(SpikelineError::InvalidParameter(format!(
            "Results of {} and {} cover {} and {} segments respectively",
            a.sorter(),
            b.sorter(),
            a.num_segments(),
            b.num_segments()
        )));
    }

    // Score all unit pairs, in parallel when the scan is large enough
    let pairs: Vec<(&Unit, &Unit)> = a
        .units()
        .iter()
        .cartesian_product(b.units().iter())
        .collect();

    let score_pair = |&(unit_a, unit_b): &(&Unit, &Unit)| {
        let score = unit_match_score(unit_a, unit_b, params.delta_time);
        (score >= params.match_score).then_some(AgreementUnit {
            unit_a: unit_a.id(),
            unit_b: unit_b.id(),
            score,
            agreement_count: 2,
        })
    };

    let mut candidates: Vec<AgreementUnit> = if pairs.len() >= MIN_PAIRS_PAR {
        pairs.par_iter().filter_map(score_pair).collect()
    } else {
        pairs.iter().filter_map(score_pair).collect()
    };
    log::debug!(
        "{} candidate pairs above match score {}",
        candidates.len(),
        params.match_score
    );

    // Greedy one-to-one assignment, best score first
    candidates.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .expect("Match scores are finite by construction")
            .then(x.unit_a.cmp(&y.unit_a))
            .then(x.unit_b.cmp(&y.unit_b))
    });

    let mut assigned_a: Vec<usize> = Vec::new();
    let mut assigned_b: Vec<usize> = Vec::new();
    let mut agreed: Vec<AgreementUnit> = Vec::new();
    for candidate in candidates {
        if assigned_a.contains(&candidate.unit_a) || assigned_b.contains(&candidate.unit_b) {
            continue;
        }
        if candidate.agreement_count < params.min_agreement {
            continue;
        }
        assigned_a.push(candidate.unit_a);
        assigned_b.push(candidate.unit_b);
        agreed.push(candidate);
    }
    agreed.sort_by(|x, y| x.unit_a.cmp(&y.unit_a));

    // Duplicate-template filter
    let num_agreed = agreed.len();
    let mut units: Vec<AgreementUnit> = Vec::with_capacity(num_agreed);
    for candidate in agreed {
        let dissimilarity =
            templates_a.dissimilarity_between(candidate.unit_a, templates_b, candidate.unit_b)?;
        if dissimilarity < params.duplicate_dissimilarity {
            log::debug!(
                "Dropping agreed pair ({}, {}): template dissimilarity {:.3} below {}",
                candidate.unit_a,
                candidate.unit_b,
                dissimilarity,
                params.duplicate_dissimilarity
            );
        } else {
            units.push(candidate);
        }
    }

    let num_duplicates_removed = num_agreed - units.len();
    log::info!(
        "Template filtering removed {} of {} agreed units",
        num_duplicates_removed,
        num_agreed
    );

    Ok(ConsensusSet {
        sorter_a: a.sorter().to_string(),
        sorter_b: b.sorter().to_string(),
        units,
        num_duplicates_removed,
    })
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    use super::*;
    use crate::sorting::SpikeTrain;

    const SEED: u64 = 42;

    fn single_segment_result(sorter: &str, units: &[(usize, &[f64])]) -> SorterResult {
        let units = units
            .iter()
            .map(|(id, times)| Unit::build(*id, vec![SpikeTrain::build(times).unwrap()]).unwrap())
            .collect();
        SorterResult::build(sorter, 1, units).unwrap()
    }

    /// One template per unit, each peaking on its own channel so that no pair
    /// looks like a duplicate.
    fn distinct_templates(sorter: &str, unit_ids: &[usize]) -> TemplateSet {
        let templates = unit_ids
            .iter()
            .enumerate()
            .map(|(channel, id)| {
                let mut template = DMatrix::zeros(4, unit_ids.len().max(2));
                template[(1, channel)] = 3.0;
                (*id, template)
            })
            .collect();
        TemplateSet::build(sorter, templates).unwrap()
    }

    #[test]
    fn test_count_matched_spikes() {
        assert_eq!(count_matched_spikes(&[0.0, 0.5, 1.0], &[0.02, 0.52, 1.01], 0.2), 3);
        assert_eq!(count_matched_spikes(&[0.0, 0.5, 1.0], &[5.0, 6.0], 0.2), 0);
        assert_eq!(count_matched_spikes(&[], &[1.0], 0.2), 0);

        // Each spike is consumed at most once
        assert_eq!(count_matched_spikes(&[0.0], &[0.1, 0.15], 0.2), 1);
        assert_eq!(count_matched_spikes(&[0.0, 0.1], &[0.05], 0.2), 1);
    }

    #[test]
    fn test_unit_match_score() {
        let unit_a = Unit::build(0, vec![SpikeTrain::build(&[0.0, 0.5, 1.0]).unwrap()]).unwrap();
        let unit_b = Unit::build(1, vec![SpikeTrain::build(&[0.02, 0.52, 9.0]).unwrap()]).unwrap();

        // 2 matches over a union of 4
        assert_eq!(unit_match_score(&unit_a, &unit_b, 0.2), 0.5);

        // Two empty trains score zero, not NaN
        let empty_a = Unit::build(0, vec![SpikeTrain::build(&[]).unwrap()]).unwrap();
        let empty_b = Unit::build(1, vec![SpikeTrain::build(&[]).unwrap()]).unwrap();
        assert_eq!(unit_match_score(&empty_a, &empty_b, 0.2), 0.0);
    }

    #[test]
    fn test_matching_scenario() {
        let a = single_segment_result("kilosort3", &[(1, &[0.0, 0.5, 1.0]), (2, &[2.0])]);
        let b = single_segment_result("kilosort2_5", &[(10, &[0.02, 0.52, 1.01])]);
        let templates_a = distinct_templates("kilosort3", &[1, 2]);
        let templates_b = TemplateSet::build("kilosort2_5", {
            let mut template = DMatrix::zeros(4, 2);
            template[(1, 1)] = 3.0;
            vec![(10, template)]
        })
        .unwrap();

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();

        // Unit 1 matches unit 10 with full overlap; unit 2 has no counterpart
        let units: Vec<&AgreementUnit> = consensus.units_iter().collect();
        assert_eq!(units.len(), 1);
        assert_eq!((units[0].unit_a, units[0].unit_b), (1, 10));
        assert_eq!(units[0].score, 1.0);
        assert_eq!(units[0].agreement_count, 2);
    }

    #[test]
    fn test_disjoint_results_yield_empty_consensus() {
        let a = single_segment_result("kilosort3", &[(0, &[0.0, 1.0, 2.0])]);
        let b = single_segment_result("kilosort2_5", &[(0, &[100.0, 101.0])]);
        let templates_a = distinct_templates("kilosort3", &[0]);
        let templates_b = distinct_templates("kilosort2_5", &[0]);

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();
        assert!(consensus.is_empty());
        assert_eq!(consensus.num_duplicates_removed(), 0);
    }

    #[test]
    fn test_empty_results_yield_empty_consensus() {
        let a = SorterResult::build("kilosort3", 1, vec![]).unwrap();
        let b = SorterResult::build("kilosort2_5", 1, vec![]).unwrap();
        let templates_a = TemplateSet::build("kilosort3", vec![]).unwrap();
        let templates_b = TemplateSet::build("kilosort2_5", vec![]).unwrap();

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();
        assert!(consensus.is_empty());
    }

    #[test]
    fn test_identical_results_are_all_duplicates() {
        let units: &[(usize, &[f64])] = &[
            (0, &[0.0, 1.0, 2.0]),
            (1, &[10.0, 11.0, 12.0]),
            (2, &[20.0, 21.0]),
        ];
        let a = single_segment_result("kilosort3", units);
        let b = single_segment_result("kilosort2_5", units);
        let templates_a = distinct_templates("kilosort3", &[0, 1, 2]);
        let templates_b = distinct_templates("kilosort2_5", &[0, 1, 2]);

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();

        // Every unit agrees with its twin, but identical templates score
        // dissimilarity 0 and the duplicate filter removes them all
        assert!(consensus.is_empty());
        assert_eq!(consensus.num_duplicates_removed(), 3);
    }

    #[test]
    fn test_greedy_assignment_prefers_best_score() {
        let a = single_segment_result("kilosort3", &[(0, &[0.0, 1.0, 2.0, 3.0])]);
        // Unit 11 overlaps fully, unit 10 only partially
        let b = single_segment_result(
            "kilosort2_5",
            &[(10, &[0.01, 1.01]), (11, &[0.01, 1.01, 2.01, 3.01])],
        );
        let templates_a = distinct_templates("kilosort3", &[0]);
        let templates_b = distinct_templates("kilosort2_5", &[10, 11]);

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();
        let units: Vec<&AgreementUnit> = consensus.units_iter().collect();
        assert_eq!(units.len(), 1);
        assert_eq!((units[0].unit_a, units[0].unit_b), (0, 11));
    }

    #[test]
    fn test_greedy_assignment_tie_break() {
        // Two B units with identical trains tie at score 1.0; the lower id wins
        let a = single_segment_result("kilosort3", &[(0, &[0.0, 1.0])]);
        let b = single_segment_result(
            "kilosort2_5",
            &[(11, &[0.0, 1.0]), (10, &[0.0, 1.0])],
        );
        // Unit 0 peaks away from both B units so the winner is not filtered
        // as a template duplicate
        let mut template = DMatrix::zeros(4, 3);
        template[(1, 2)] = 3.0;
        let templates_a = TemplateSet::build("kilosort3", vec![(0, template)]).unwrap();
        let templates_b = TemplateSet::build("kilosort2_5", {
            let mut on_first = DMatrix::zeros(4, 3);
            on_first[(1, 0)] = 3.0;
            let mut on_second = DMatrix::zeros(4, 3);
            on_second[(1, 1)] = 3.0;
            vec![(10, on_first), (11, on_second)]
        })
        .unwrap();

        let consensus =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default())
                .unwrap();
        let units: Vec<&AgreementUnit> = consensus.units_iter().collect();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_b, 10);
    }

    #[test]
    fn test_missing_template_is_fatal() {
        let a = single_segment_result("kilosort3", &[(0, &[0.0, 1.0])]);
        let b = single_segment_result("kilosort2_5", &[(10, &[0.0, 1.0])]);
        let templates_a = distinct_templates("kilosort3", &[0]);
        // No template for unit 10
        let templates_b = TemplateSet::build("kilosort2_5", vec![]).unwrap();

        let result =
            build_consensus(&a, &b, &templates_a, &templates_b, &ConsensusParams::default());
        assert!(matches!(
            result,
            Err(SpikelineError::DataIntegrity { unit: 10, .. })
        ));
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        let a = SorterResult::build("kilosort3", 1, vec![]).unwrap();
        let b = SorterResult::build("kilosort2_5", 1, vec![]).unwrap();
        let templates = TemplateSet::build("kilosort3", vec![]).unwrap();

        let params = ConsensusParams {
            delta_time: -1.0,
            ..ConsensusParams::default()
        };
        assert!(matches!(
            build_consensus(&a, &b, &templates, &templates, &params),
            Err(SpikelineError::InvalidParameter(_))
        ));

        let params = ConsensusParams {
            match_score: 0.0,
            ..ConsensusParams::default()
        };
        assert!(params.validate().is_err());

        let params = ConsensusParams {
            duplicate_dissimilarity: 1.5,
            ..ConsensusParams::default()
        };
        assert!(params.validate().is_err());

        // Only two sorters are compared, so 0 and 3+ are meaningless
        let params = ConsensusParams {
            min_agreement: 0,
            ..ConsensusParams::default()
        };
        assert!(params.validate().is_err());

        let params = ConsensusParams {
            min_agreement: 3,
            ..ConsensusParams::default()
        };
        assert!(params.validate().is_err());

        let params = ConsensusParams {
            min_agreement: 1,
            ..ConsensusParams::default()
        };
        assert_eq!(params.validate(), Ok(()));
    }

    #[test]
    fn test_jittered_trains_still_match() {
        // Sorter B reports the same spikes with sub-tolerance timing noise
        let mut rng = StdRng::seed_from_u64(SEED);
        let normal = Normal::new(0.0, 0.02).unwrap();

        let times_a: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let times_b: Vec<f64> = times_a
            .iter()
            .map(|t| t + normal.sample(&mut rng))
            .collect();

        let a = single_segment_result("kilosort3", &[(0, &times_a)]);
        let b = single_segment_result("kilosort2_5", &[(5, &times_b)]);
        let unit_a = a.unit_ref(0).unwrap();
        let unit_b = b.unit_ref(5).unwrap();

        assert_eq!(unit_match_score(unit_a, unit_b, 0.2), 1.0);

        // Far below tolerance the same trains stop matching
        assert!(unit_match_score(unit_a, unit_b, 1e-6) < 0.3);
    }
}
