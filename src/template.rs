//! Module implementing waveform templates and their comparison.
//!
//! A template is the average waveform shape of a unit, stored as a
//! time-samples × channels matrix. Comparing two templates collapses the time
//! axis to a per-channel peak-amplitude vector, so that two sorters reporting
//! the same physical unit at slightly different alignments still produce
//! near-identical signatures.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use serde_json;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::SpikelineError;

/// The per-unit waveform templates of one sorter run, indexed by unit id.
/// All templates share the same shape (time samples × channels).
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TemplateSet {
    sorter: String,
    templates: Vec<(usize, DMatrix<f64>)>,
}

impl TemplateSet {
    /// Create a template set from per-unit waveform matrices.
    ///
    /// # Errors
    ///
    /// Returns a data integrity error if a template is empty, if a unit id
    /// appears twice, or if the templates do not all share the same shape.
    pub fn build(
        sorter: &str,
        templates: Vec<(usize, DMatrix<f64>)>,
    ) -> Result<Self, SpikelineError> {
        for (i, (unit_id, template)) in templates.iter().enumerate() {
            if template.is_empty() {
                return Err(SpikelineError::DataIntegrity {
                    sorter: sorter.to_string(),
                    unit: *unit_id,
                    reason: "empty template".to_string(),
                });
            }
            if templates[..i].iter().any(|(other_id, _)| other_id == unit_id) {
                return Err(SpikelineError::DataIntegrity {
                    sorter: sorter.to_string(),
                    unit: *unit_id,
                    reason: "duplicate template for unit id".to_string(),
                });
            }
            if template.shape() != templates[0].1.shape() {
                return Err(SpikelineError::DataIntegrity {
                    sorter: sorter.to_string(),
                    unit: *unit_id,
                    reason: format!(
                        "template shape {:?} does not match {:?}",
                        template.shape(),
                        templates[0].1.shape()
                    ),
                });
            }
        }

        Ok(TemplateSet {
            sorter: sorter.to_string(),
            templates,
        })
    }

    /// Returns the name of the sorting algorithm that produced the templates.
    pub fn sorter(&self) -> &str {
        &self.sorter
    }

    /// The number of templates in the set.
    pub fn num_templates(&self) -> usize {
        self.templates.len()
    }

    /// The number of recording channels, or `None` for an empty set.
    pub fn num_channels(&self) -> Option<usize> {
        self.templates.first().map(|(_, template)| template.ncols())
    }

    /// A reference to the template of the specified unit.
    /// Returns `None` if the unit is not found.
    pub fn template_ref(&self, unit_id: usize) -> Option<&DMatrix<f64>> {
        self.templates
            .iter()
            .find(|(other_id, _)| *other_id == unit_id)
            .map(|(_, template)| template)
    }

    /// The L2-normalized per-channel peak-amplitude vector of the specified
    /// unit: the maximum absolute amplitude across time for every channel,
    /// scaled to unit norm.
    ///
    /// # Errors
    ///
    /// Returns a data integrity error if the unit has no template or if its
    /// template is identically zero (no normalizable signature).
    pub fn channel_amplitudes(&self, unit_id: usize) -> Result<DVector<f64>, SpikelineError> {
        let template = self
            .template_ref(unit_id)
            .ok_or_else(|| SpikelineError::DataIntegrity {
                sorter: self.sorter.clone(),
                unit: unit_id,
                reason: "missing template".to_string(),
            })?;

        let amplitudes = DVector::from_iterator(
            template.ncols(),
            template
                .column_iter()
                .map(|channel| channel.iter().fold(0.0_f64, |max, x| max.max(x.abs()))),
        );

        let norm = amplitudes.norm();
        if norm == 0.0 {
            return Err(SpikelineError::DataIntegrity {
                sorter: self.sorter.clone(),
                unit: unit_id,
                reason: "template is identically zero".to_string(),
            });
        }

        Ok(amplitudes / norm)
    }

    /// The bounded dissimilarity between the channel-amplitude signatures of a
    /// unit in this set and a unit in another set: the sum of squared
    /// differences of the two normalized vectors, divided by two. Scores lie
    /// in [0, 1], with 0 meaning identical channel-amplitude shape.
    ///
    /// # Errors
    ///
    /// Returns a data integrity error if either template is missing or
    /// malformed, or if the channel counts of the two sets disagree.
    pub fn dissimilarity_between(
        &self,
        unit_id: usize,
        other: &TemplateSet,
        other_unit_id: usize,
    ) -> Result<f64, SpikelineError> {
        let amplitudes = self.channel_amplitudes(unit_id)?;
        let other_amplitudes = other.channel_amplitudes(other_unit_id)?;

        if amplitudes.len() != other_amplitudes.len() {
            return Err(SpikelineError::DataIntegrity {
                sorter: other.sorter.clone(),
                unit: other_unit_id,
                reason: format!(
                    "channel count {} does not match {} of sorter {}",
                    other_amplitudes.len(),
                    amplitudes.len(),
                    self.sorter
                ),
            });
        }

        Ok((amplitudes - other_amplitudes).norm_squared() / 2.0)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> std::io::Result<TemplateSet> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}
