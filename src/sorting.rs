//! Module implementing the output of a spike sorter: spike trains, units, and
//! the collection of units produced by one sorting run.
//!
//! # Examples
//!
//! ```rust
//! use spikeline::sorting::{SpikeTrain, Unit, SorterResult};
//!
//! let units = vec![
//!     Unit::build(0, vec![SpikeTrain::build(&[0.0, 0.5, 1.0]).unwrap()]).unwrap(),
//!     Unit::build(1, vec![SpikeTrain::build(&[2.0]).unwrap()]).unwrap(),
//! ];
//! let result = SorterResult::build("kilosort3", 1, units).unwrap();
//!
//! // Drop degenerate units (one spike or fewer in total)
//! let result = result.retain_active_units();
//! assert_eq!(result.unit_ids(), vec![0]);
//! ```
use serde::{Deserialize, Serialize};
use serde_json;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::SpikelineError;

/// An ordered sequence of spike timestamps for one unit in one recording segment.
/// Immutable once produced by a sorter.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SpikeTrain {
    times: Vec<f64>,
}

impl SpikeTrain {
    /// Create a spike train with the specified firing times.
    /// If necessary, the firing times are sorted.
    /// The function returns an error for non-finite firing times.
    pub fn build(times: &[f64]) -> Result<Self, SpikelineError> {
        for t in times {
            if !t.is_finite() {
                return Err(SpikelineError::InvalidParameter(format!(
                    "Spike time must be finite, got {}",
                    t
                )));
            }
        }

        let mut times = times.to_vec();
        times.sort_by(|t1, t2| {
            t1.partial_cmp(t2)
                .expect("Comparison failed: NaN values should have been caught earlier")
        });

        Ok(SpikeTrain { times })
    }

    /// Returns the firing times of the spike train.
    pub fn times(&self) -> &[f64] {
        &self.times[..]
    }

    /// The number of spikes in the train.
    pub fn num_spikes(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// A putative single neuron identified by one sorter run: an identifier plus
/// one spike train per recording segment.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Unit {
    id: usize,
    trains: Vec<SpikeTrain>,
}

impl Unit {
    /// Create a unit with the specified id and per-segment spike trains.
    /// The function returns an error if the unit covers no segment at all.
    pub fn build(id: usize, trains: Vec<SpikeTrain>) -> Result<Self, SpikelineError> {
        if trains.is_empty() {
            return Err(SpikelineError::InvalidParameter(format!(
                "Unit {} must cover at least one segment",
                id
            )));
        }
        Ok(Unit { id, trains })
    }

    /// Returns the ID of the unit.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The spike train of the unit in the specified segment.
    /// Returns `None` if the segment is out of bounds.
    pub fn train(&self, segment: usize) -> Option<&SpikeTrain> {
        self.trains.get(segment)
    }

    /// An iterator over the per-segment spike trains of the unit.
    pub fn trains_iter(&self) -> impl Iterator<Item = &SpikeTrain> + '_ {
        self.trains.iter()
    }

    /// The number of segments the unit covers.
    pub fn num_segments(&self) -> usize {
        self.trains.len()
    }

    /// The total number of spikes across all segments.
    pub fn total_spikes(&self) -> usize {
        self.trains.iter().map(|train| train.num_spikes()).sum()
    }
}

/// The set of units produced by one sorting algorithm over one recording.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SorterResult {
    sorter: String,
    num_segments: usize,
    units: Vec<Unit>,
}

impl SorterResult {
    /// Create a sorter result from the units of one sorting run.
    ///
    /// # Errors
    ///
    /// Returns a data integrity error if a unit id appears twice or if a unit
    /// does not cover the expected number of segments.
    pub fn build(
        sorter: &str,
        num_segments: usize,
        units: Vec<Unit>,
    ) -> Result<Self, SpikelineError> {
        for (i, unit) in units.iter().enumerate() {
            if unit.num_segments() != num_segments {
                return Err(SpikelineError::DataIntegrity {
                    sorter: sorter.to_string(),
                    unit: unit.id(),
                    reason: format!(
                        "expected {} segments, found {}",
                        num_segments,
                        unit.num_segments()
                    ),
                });
            }
            if units[..i].iter().any(|other| other.id() == unit.id()) {
                return Err(SpikelineError::DataIntegrity {
                    sorter: sorter.to_string(),
                    unit: unit.id(),
                    reason: "duplicate unit id".to_string(),
                });
            }
        }

        Ok(SorterResult {
            sorter: sorter.to_string(),
            num_segments,
            units,
        })
    }

    /// Returns the name of the sorting algorithm that produced the result.
    pub fn sorter(&self) -> &str {
        &self.sorter
    }

    /// The number of recording segments.
    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// The number of units in the result.
    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// A reference to the unit with the specified id.
    /// Returns `None` if the unit is not found.
    pub fn unit_ref(&self, unit_id: usize) -> Option<&Unit> {
        self.units.iter().find(|unit| unit.id() == unit_id)
    }

    /// The units in the result.
    pub fn units(&self) -> &[Unit] {
        &self.units[..]
    }

    /// An iterator over the units in the result.
    pub fn units_iter(&self) -> impl Iterator<Item = &Unit> + '_ {
        self.units.iter()
    }

    /// The ids of all units in the result.
    pub fn unit_ids(&self) -> Vec<usize> {
        self.units.iter().map(|unit| unit.id()).collect()
    }

    /// Discard degenerate units: a unit is retained only if its total spike
    /// count across all segments is greater than one. A unit firing once (or
    /// never) carries no usable waveform statistics downstream.
    ///
    /// Pure function of its input; idempotent.
    pub fn retain_active_units(&self) -> Self {
        let units: Vec<Unit> = self
            .units
            .iter()
            .filter(|unit| unit.total_spikes() > 1)
            .cloned()
            .collect();

        SorterResult {
            sorter: self.sorter.clone(),
            num_segments: self.num_segments,
            units,
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> std::io::Result<SorterResult> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_segment_result() -> SorterResult {
        let units = vec![
            Unit::build(
                0,
                vec![
                    SpikeTrain::build(&[0.5, 1.5, 2.5]).unwrap(),
                    SpikeTrain::build(&[10.0]).unwrap(),
                ],
            )
            .unwrap(),
            Unit::build(
                1,
                vec![
                    SpikeTrain::build(&[3.0]).unwrap(),
                    SpikeTrain::build(&[]).unwrap(),
                ],
            )
            .unwrap(),
            Unit::build(
                2,
                vec![
                    SpikeTrain::build(&[]).unwrap(),
                    SpikeTrain::build(&[]).unwrap(),
                ],
            )
            .unwrap(),
            Unit::build(
                3,
                vec![
                    SpikeTrain::build(&[1.0]).unwrap(),
                    SpikeTrain::build(&[2.0]).unwrap(),
                ],
            )
            .unwrap(),
        ];
        SorterResult::build("kilosort3", 2, units).unwrap()
    }

    #[test]
    fn test_spike_train_build() {
        // Unsorted firing times are sorted
        let train = SpikeTrain::build(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(train.times(), &[1.0, 2.0, 3.0]);

        // Empty spike train
        let train = SpikeTrain::build(&[]).unwrap();
        assert_eq!(train.times(), &[] as &[f64]);

        // Non-finite firing times are rejected
        assert!(SpikeTrain::build(&[0.0, f64::NAN]).is_err());
        assert!(SpikeTrain::build(&[f64::INFINITY]).is_err());
    }

    #[test]
    fn test_sorter_result_build() {
        // Mismatched segment count
        let units = vec![Unit::build(0, vec![SpikeTrain::build(&[1.0]).unwrap()]).unwrap()];
        let result = SorterResult::build("kilosort3", 2, units);
        assert_eq!(
            result,
            Err(SpikelineError::DataIntegrity {
                sorter: "kilosort3".to_string(),
                unit: 0,
                reason: "expected 2 segments, found 1".to_string(),
            })
        );

        // Duplicate unit ids
        let units = vec![
            Unit::build(7, vec![SpikeTrain::build(&[1.0]).unwrap()]).unwrap(),
            Unit::build(7, vec![SpikeTrain::build(&[2.0]).unwrap()]).unwrap(),
        ];
        let result = SorterResult::build("kilosort3", 1, units);
        assert_eq!(
            result,
            Err(SpikelineError::DataIntegrity {
                sorter: "kilosort3".to_string(),
                unit: 7,
                reason: "duplicate unit id".to_string(),
            })
        );
    }

    #[test]
    fn test_retain_active_units() {
        let result = two_segment_result();
        let filtered = result.retain_active_units();

        // Unit 1 (one spike in total) and unit 2 (no spikes) are dropped,
        // unit 3 (one spike in each of two segments) is retained.
        assert_eq!(filtered.unit_ids(), vec![0, 3]);

        // Retained units are unchanged
        assert_eq!(
            filtered.unit_ref(0),
            result.unit_ref(0),
        );
    }

    #[test]
    fn test_retain_active_units_idempotent() {
        let filtered = two_segment_result().retain_active_units();
        assert_eq!(filtered.retain_active_units(), filtered);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorter_result.json");

        let result = two_segment_result();
        result.save_to(&path).unwrap();
        assert_eq!(SorterResult::load_from(&path).unwrap(), result);
    }
}
