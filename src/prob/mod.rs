use nalgebra::*;
use std::fmt::{self, Display};
use thiserror::Error;

/// Multivariate normal density evaluation, with the precision matrix and
/// log-determinant cached at construction.
mod multinormal;

pub use multinormal::*;

/// Per-state gaussian emissions of a hidden Markov model.
mod emission;

pub use emission::*;

/// Identifies where a failure happened, so the caller can tell which
/// sequence, hidden state or timestep carried the offending value.
/// All fields are optional; absent fields are not rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {

    pub seq : Option<usize>,

    pub state : Option<usize>,

    pub step : Option<usize>

}

impl Location {

    pub fn none() -> Self {
        Self::default()
    }

    pub fn state(i : usize) -> Self {
        Self { state : Some(i), ..Self::default() }
    }

    pub fn seq(k : usize) -> Self {
        Self { seq : Some(k), ..Self::default() }
    }

}

impl Display for Location {

    fn fmt(&self, f : &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(k) = self.seq {
            parts.push(format!("sequence {}", k));
        }
        if let Some(i) = self.state {
            parts.push(format!("state {}", i));
        }
        if let Some(t) = self.step {
            parts.push(format!("step {}", t));
        }
        if parts.is_empty() {
            Ok(())
        } else {
            write!(f, " (at {})", parts.join(", "))
        }
    }

}

/// Failures of density evaluation, likelihood building and parameter re-estimation.
/// None of them is transient: they signal either a caller contract violation
/// (shapes) or numerically degenerate input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HmmError {

    #[error("Dimension mismatch{at}: expected {expected}, found {found}")]
    DimensionMismatch { expected : usize, found : usize, at : Location },

    #[error("Covariance matrix{at} is singular or not positive-definite")]
    SingularCovariance { at : Location },

    #[error("Degenerate statistics{at}: {reason}")]
    DegenerateStatistics { reason : String, at : Location },

    #[error("Invalid parameters{at}: {reason}")]
    InvalidParameters { reason : String, at : Location }

}

impl HmmError {

    pub fn mismatch(expected : usize, found : usize) -> Self {
        HmmError::DimensionMismatch { expected, found, at : Location::none() }
    }

    pub fn degenerate(reason : impl Into<String>) -> Self {
        HmmError::DegenerateStatistics { reason : reason.into(), at : Location::none() }
    }

    pub fn invalid(reason : impl Into<String>) -> Self {
        HmmError::InvalidParameters { reason : reason.into(), at : Location::none() }
    }

    /// Where the error happened.
    pub fn location(&self) -> &Location {
        match self {
            HmmError::DimensionMismatch { at, .. } => at,
            HmmError::SingularCovariance { at } => at,
            HmmError::DegenerateStatistics { at, .. } => at,
            HmmError::InvalidParameters { at, .. } => at
        }
    }

    fn location_mut(&mut self) -> &mut Location {
        match self {
            HmmError::DimensionMismatch { at, .. } => at,
            HmmError::SingularCovariance { at } => at,
            HmmError::DegenerateStatistics { at, .. } => at,
            HmmError::InvalidParameters { at, .. } => at
        }
    }

    /// Tags the error with the sequence index.
    pub fn at_seq(mut self, k : usize) -> Self {
        self.location_mut().seq = Some(k);
        self
    }

    /// Tags the error with the hidden state index.
    pub fn at_state(mut self, i : usize) -> Self {
        self.location_mut().state = Some(i);
        self
    }

    /// Tags the error with the timestep.
    pub fn at_step(mut self, t : usize) -> Self {
        self.location_mut().step = Some(t);
        self
    }

}

/// Capability shared by every emission family a hidden Markov model can be
/// composed with. The chain (initial and transition probabilities) only sees
/// the emission through the likelihood matrix, so implementors never depend on
/// chain internals. Sequences are arranged with one observation per row.
pub trait Emission {

    /// Number of hidden states this emission model covers.
    fn n_hidden(&self) -> usize;

    /// Dimensionality of a single observation.
    fn n_dim(&self) -> usize;

    /// Returns the T x n_hidden matrix holding the probability of each
    /// observation (row of seq) under each hidden state.
    fn likelihood(&self, seq : DMatrixSlice<'_, f64>) -> Result<DMatrix<f64>, HmmError>;

    /// Natural logarithm of the likelihood matrix. Implementors that can evaluate
    /// the log-density directly should override this to avoid underflow.
    fn log_likelihood(&self, seq : DMatrixSlice<'_, f64>) -> Result<DMatrix<f64>, HmmError> {
        self.likelihood(seq).map(|b| b.map(f64::ln) )
    }

}
