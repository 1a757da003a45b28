use serde::{Serialize, Deserialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use anyhow::Context;
use crate::prob::HmmError;

/// Denominator of the mean re-estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanNormalization {

    /// Divide the occupancy-weighted sum of observations by the occupancy mass
    /// of the state (the usual Baum-Welch update, a weighted average).
    Occupancy,

    /// Divide the occupancy-weighted sum of observations by the number of
    /// sequences. Kept for compatibility with estimates produced this way; the
    /// result is not an average unless each state is occupied exactly once per sequence.
    SequenceCount

}

impl Default for MeanNormalization {

    fn default() -> Self {
        MeanNormalization::Occupancy
    }

}

/// Which timesteps contribute to the occupancy mass dividing the expected
/// transition counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancySpan {

    /// Only timesteps with an outgoing transition (all but the last of each sequence).
    /// For consistent posteriors every row of the transition matrix then sums to one.
    Transitions,

    /// Every timestep. The last step of each sequence adds occupancy without adding
    /// transitions, so rows sum to slightly less than one.
    AllSteps

}

impl Default for OccupancySpan {

    fn default() -> Self {
        OccupancySpan::Transitions
    }

}

/// Tuning of the maximization step. Missing JSON fields take their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmConfig {

    pub mean_normalization : MeanNormalization,

    pub transition_span : OccupancySpan,

    /// Added (divided by the number of hidden states) to the occupancy mass
    /// dividing each covariance, so a state with vanishing responsibility does not
    /// divide by zero.
    pub regularization : f64,

    /// Added to the diagonal of every re-estimated covariance.
    pub min_covar : f64

}

impl Default for EmConfig {

    fn default() -> Self {
        Self {
            mean_normalization : MeanNormalization::default(),
            transition_span : OccupancySpan::default(),
            regularization : 1E-2,
            min_covar : 0.0
        }
    }

}

impl EmConfig {

    /// Configuration reproducing the sequence-count mean normalization and the
    /// all-steps transition denominator.
    pub fn reference() -> Self {
        Self {
            mean_normalization : MeanNormalization::SequenceCount,
            transition_span : OccupancySpan::AllSteps,
            ..Self::default()
        }
    }

    /// Amount added to the occupancy mass dividing each covariance.
    pub fn covariance_regularizer(&self, n_hidden : usize) -> f64 {
        self.regularization / n_hidden as f64
    }

    pub fn validate(&self) -> Result<(), HmmError> {
        if !(self.regularization > 0.0) || !self.regularization.is_finite() {
            return Err(HmmError::invalid(format!(
                "Regularization should be a positive number, found {}",
                self.regularization
            )));
        }
        if !(self.min_covar >= 0.0) || !self.min_covar.is_finite() {
            return Err(HmmError::invalid(format!(
                "Covariance floor should be non-negative, found {}",
                self.min_covar
            )));
        }
        Ok(())
    }

    pub fn load_from_path<P>(path : P) -> anyhow::Result<Self>
    where
        P : AsRef<Path>
    {
        let path = path.as_ref();
        let f = File::open(path)
            .with_context(|| format!("Could not open configuration at {}", path.display()) )?;
        Self::load(f)
    }

    pub fn load<R>(mut reader : R) -> anyhow::Result<Self>
    where
        R : Read
    {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        let config : EmConfig = serde_json::from_str(&content[..])
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path<P>(&self, path : P) -> anyhow::Result<()>
    where
        P : AsRef<Path>
    {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        self.save(file)
    }

    pub fn save<W>(&self, mut writer : W) -> anyhow::Result<()>
    where
        W : Write
    {
        let content = serde_json::to_string_pretty(&self)?;
        writer.write_all(content.as_bytes())?;
        Ok(())
    }

}
