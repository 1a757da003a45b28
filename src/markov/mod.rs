use nalgebra::*;
use serde::{Serialize, Deserialize};
use std::convert::TryFrom;
use crate::prob::{HmmError, Location};

/// Tolerance for a probability vector to be considered as summing to unity.
pub const PROB_TOL : f64 = 1E-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {

    pub initial : DVector<f64>,

    pub transition : DMatrix<f64>,

    /// Whether transition rows may sum to less than one.
    #[serde(default)]
    pub substochastic : bool

}

/// A discrete Markov chain over n hidden states: the probability of starting at
/// each state and the matrix of transition probabilities, where entry (i, j) is the
/// probability of moving from state i to state j.
/// The chain knows nothing about what the states emit; hidden Markov models compose
/// it with an emission model (see prob::Emission).
///
/// The initial probabilities always sum to one. Transition rows sum to one, unless the
/// chain is substochastic: then each row sums to at most one, the missing mass being the
/// probability of the sequence ending at that state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ChainParams", into = "ChainParams")]
pub struct Chain {

    initial : DVector<f64>,

    transition : DMatrix<f64>,

    substochastic : bool

}

impl Chain {

    /// Verifies that initial is a probability vector and transition is a square
    /// row-stochastic matrix of the same size.
    pub fn new(initial : DVector<f64>, transition : DMatrix<f64>) -> Result<Self, HmmError> {
        Self::build(initial, transition, false)
    }

    /// Verifies that initial is a probability vector and transition is a square
    /// matrix of the same size whose rows sum to at most one.
    pub fn new_substochastic(initial : DVector<f64>, transition : DMatrix<f64>) -> Result<Self, HmmError> {
        Self::build(initial, transition, true)
    }

    fn build(initial : DVector<f64>, transition : DMatrix<f64>, substochastic : bool) -> Result<Self, HmmError> {
        let n = initial.nrows();
        if n == 0 {
            return Err(HmmError::invalid("At least one hidden state is required"));
        }
        if transition.nrows() != n || transition.ncols() != n {
            return Err(HmmError::invalid(format!(
                "Transition matrix should be {}x{}, but is {}x{}",
                n,
                n,
                transition.nrows(),
                transition.ncols()
            )));
        }
        check_chain(&initial, &transition, substochastic)
            .map_err(|(reason, at)| HmmError::InvalidParameters { reason, at } )?;
        Ok(Self { initial, transition, substochastic })
    }

    /// Chain with uniform initial and transition probabilities.
    pub fn uniform(n : usize) -> Result<Self, HmmError> {
        let p = 1. / n as f64;
        Self::new(DVector::from_element(n, p), DMatrix::from_element(n, n, p))
    }

    /// Builds a chain from re-estimated values, which are held to the same
    /// sums as a chain built with new (or new_substochastic). Failures are reported
    /// as degenerate statistics, since the estimates are only as good as the
    /// posteriors they came from.
    pub(crate) fn from_estimates(
        initial : DVector<f64>,
        transition : DMatrix<f64>,
        substochastic : bool
    ) -> Result<Self, HmmError> {
        check_chain(&initial, &transition, substochastic)
            .map_err(|(reason, at)| HmmError::DegenerateStatistics {
                reason : format!("{} after re-estimation", reason),
                at
            })?;
        Ok(Self { initial, transition, substochastic })
    }

    pub fn n_hidden(&self) -> usize {
        self.initial.nrows()
    }

    pub fn initial(&self) -> &DVector<f64> {
        &self.initial
    }

    pub fn transition(&self) -> &DMatrix<f64> {
        &self.transition
    }

    pub fn is_substochastic(&self) -> bool {
        self.substochastic
    }

}

fn check_chain(
    initial : &DVector<f64>,
    transition : &DMatrix<f64>,
    substochastic : bool
) -> Result<(), (String, Location)> {
    check_prob(initial.iter(), false)
        .map_err(|r| (format!("Initial probabilities {}", r), Location::none()) )?;
    for (i, row) in transition.row_iter().enumerate() {
        check_prob(row.iter(), substochastic)
            .map_err(|r| (format!("Transition probabilities {}", r), Location::state(i)) )?;
    }
    Ok(())
}

/// With at_most set, any sum up to one is accepted.
fn check_prob<'a>(probs : impl Iterator<Item=&'a f64>, at_most : bool) -> Result<(), String> {
    let mut sum = 0.;
    for p in probs {
        if !p.is_finite() || *p < 0. {
            return Err(format!("contain invalid value {}", p));
        }
        sum += p;
    }
    if sum > 1. + PROB_TOL {
        Err(format!("sum to {}, above 1", sum))
    } else if !at_most && sum < 1. - PROB_TOL {
        Err(format!("sum to {} instead of 1", sum))
    } else {
        Ok(())
    }
}

impl TryFrom<ChainParams> for Chain {

    type Error = HmmError;

    fn try_from(p : ChainParams) -> Result<Self, HmmError> {
        Chain::build(p.initial, p.transition, p.substochastic)
    }

}

impl From<Chain> for ChainParams {

    fn from(c : Chain) -> Self {
        ChainParams { initial : c.initial, transition : c.transition, substochastic : c.substochastic }
    }

}
