use nalgebra::*;
use tracing::{debug, trace, warn};
use crate::prob::*;
use crate::markov::Chain;
use super::config::*;

/// Hidden Markov model with multivariate gaussian emissions, fitted by the
/// expectation maximization (Baum-Welch) algorithm. This structure covers both
/// ends of an EM iteration that touch the emission densities:
///
/// - likelihood(.) builds the matrix of emission densities of every observation
/// under every hidden state, which an external forward-backward procedure turns into
/// the state occupancy (gamma) and transition (epsilon) posteriors;
///
/// - maximize(.) consumes those posteriors and re-estimates the initial state
/// distribution, the transition matrix and the per-state means and covariances.
///
/// The model is a composition of a Chain (initial and transition probabilities) and
/// a GaussianEmission (one MultiNormal per state). Since each MultiNormal caches its
/// precision matrix, replacing the components at the end of maximize(.) refreshes the
/// precisions together with the covariances, and likelihood(.) always reflects the
/// last successful update.
///
/// maximize(.) is atomic: all quantities are estimated into new values and only
/// committed when every step succeeded, so a failed call leaves the model as it was.
///
/// # References
/// Rabiner, L. R. (1989). A tutorial on hidden Markov models and selected applications in
/// speech recognition. Proceedings of the IEEE, 77(2), 257–286. doi: 10.1109/5.18626
#[derive(Debug, Clone)]
pub struct GaussianHmm {

    chain : Chain,

    emission : GaussianEmission,

    config : EmConfig

}

impl GaussianHmm {

    /// Builds the model from the initial guesses, with the default configuration.
    /// - initial_prob : n_hidden probabilities
    /// - transition_prob : n_hidden x n_hidden row-stochastic matrix
    /// - means : n_hidden x n_dim (one state per row)
    /// - covs : n_hidden positive-definite n_dim x n_dim matrices
    pub fn new(
        initial_prob : DVector<f64>,
        transition_prob : DMatrix<f64>,
        means : DMatrix<f64>,
        covs : Vec<DMatrix<f64>>
    ) -> Result<Self, HmmError> {
        Self::with_config(initial_prob, transition_prob, means, covs, EmConfig::default())
    }

    pub fn with_config(
        initial_prob : DVector<f64>,
        transition_prob : DMatrix<f64>,
        means : DMatrix<f64>,
        covs : Vec<DMatrix<f64>>,
        config : EmConfig
    ) -> Result<Self, HmmError> {
        let chain = match config.transition_span {
            OccupancySpan::Transitions => Chain::new(initial_prob, transition_prob)?,
            OccupancySpan::AllSteps => Chain::new_substochastic(initial_prob, transition_prob)?
        };
        let emission = GaussianEmission::new(&means, covs)?;
        Self::from_parts(chain, emission, config)
    }

    /// Composes an already validated chain and emission model, which should cover
    /// the same number of hidden states.
    pub fn from_parts(chain : Chain, emission : GaussianEmission, config : EmConfig) -> Result<Self, HmmError> {
        if chain.n_hidden() != emission.n_hidden() {
            return Err(HmmError::invalid(format!(
                "Chain has {} states, but emission has {}",
                chain.n_hidden(),
                emission.n_hidden()
            )));
        }
        config.validate()?;
        Ok(Self { chain, emission, config })
    }

    pub fn n_hidden(&self) -> usize {
        self.chain.n_hidden()
    }

    pub fn n_dim(&self) -> usize {
        self.emission.n_dim()
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn emission(&self) -> &GaussianEmission {
        &self.emission
    }

    pub fn config(&self) -> &EmConfig {
        &self.config
    }

    pub fn set_config(&mut self, config : EmConfig) -> Result<(), HmmError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn initial_prob(&self) -> &DVector<f64> {
        self.chain.initial()
    }

    pub fn transition_prob(&self) -> &DMatrix<f64> {
        self.chain.transition()
    }

    /// Means arranged as an n_hidden x n_dim matrix.
    pub fn means(&self) -> DMatrix<f64> {
        self.emission.means()
    }

    /// Per-state gaussians, which hold the mean, covariance and precision of each state.
    pub fn components(&self) -> &[MultiNormal] {
        self.emission.components()
    }

    /// Mean of state i. Panics if i >= n_hidden.
    pub fn mean(&self, i : usize) -> &DVector<f64> {
        self.components()[i].mean()
    }

    /// Covariance of state i. Panics if i >= n_hidden.
    pub fn cov(&self, i : usize) -> &DMatrix<f64> {
        self.components()[i].cov()
    }

    /// Precision (inverse covariance) of state i. Panics if i >= n_hidden.
    pub fn precision(&self, i : usize) -> &DMatrix<f64> {
        self.components()[i].precision()
    }

    /// T x n_hidden matrix of emission densities for the sequence (one observation per row).
    pub fn likelihood(&self, seq : &DMatrix<f64>) -> Result<DMatrix<f64>, HmmError> {
        self.emission.likelihood(seq.into())
    }

    /// T x n_hidden matrix of emission log-densities.
    pub fn log_likelihood(&self, seq : &DMatrix<f64>) -> Result<DMatrix<f64>, HmmError> {
        self.emission.log_likelihood(seq.into())
    }

    /// Re-estimates all parameters from the posteriors of an E-step.
    /// - qs : num sequences, each T_k x n_dim
    /// - gammas : num occupancy matrices, each T_k x n_hidden
    /// - epsilons : num collections of T_k - 1 transition matrices, each n_hidden x n_hidden,
    /// where epsilons[k][t][(i, j)] is the probability of being at i at t and at j at t+1.
    pub fn maximize(
        &mut self,
        qs : &[DMatrix<f64>],
        gammas : &[DMatrix<f64>],
        epsilons : &[Vec<DMatrix<f64>>]
    ) -> Result<(), HmmError> {
        match maximization_step(self.n_hidden(), self.n_dim(), qs, gammas, epsilons, &self.config) {
            Ok((chain, emission)) => {
                self.chain = chain;
                self.emission = emission;
                Ok(())
            },
            Err(e) => {
                warn!("Maximization rejected, parameters left unchanged: {}", e);
                Err(e)
            }
        }
    }

}

/// Verifies the posterior statistics have shapes compatible with the sequences and the
/// model, and that every entry is a finite probability.
fn check_statistics(
    n_hidden : usize,
    n_dim : usize,
    qs : &[DMatrix<f64>],
    gammas : &[DMatrix<f64>],
    epsilons : &[Vec<DMatrix<f64>>]
) -> Result<(), HmmError> {
    let num = qs.len();
    if gammas.len() != num {
        return Err(HmmError::mismatch(num, gammas.len()));
    }
    if epsilons.len() != num {
        return Err(HmmError::mismatch(num, epsilons.len()));
    }
    if num == 0 {
        return Err(HmmError::degenerate("No sequences informed"));
    }
    let is_prob = |p : &f64| p.is_finite() && *p >= 0.;
    for (k, ((q, gamma), epsilon)) in qs.iter().zip(gammas.iter()).zip(epsilons.iter()).enumerate() {
        let t_k = q.nrows();
        if t_k == 0 {
            return Err(HmmError::degenerate("Empty sequence").at_seq(k));
        }
        if q.ncols() != n_dim {
            return Err(HmmError::mismatch(n_dim, q.ncols()).at_seq(k));
        }
        if gamma.nrows() != t_k {
            return Err(HmmError::mismatch(t_k, gamma.nrows()).at_seq(k));
        }
        if gamma.ncols() != n_hidden {
            return Err(HmmError::mismatch(n_hidden, gamma.ncols()).at_seq(k));
        }
        if epsilon.len() != t_k - 1 {
            return Err(HmmError::mismatch(t_k - 1, epsilon.len()).at_seq(k));
        }
        for t in 0..t_k {
            if !q.row(t).iter().all(|x| x.is_finite() ) {
                return Err(HmmError::degenerate("Non-finite observation").at_seq(k).at_step(t));
            }
            if !gamma.row(t).iter().all(is_prob) {
                return Err(HmmError::degenerate("Invalid occupancy probability").at_seq(k).at_step(t));
            }
        }
        for (t, eps) in epsilon.iter().enumerate() {
            if eps.nrows() != n_hidden || eps.ncols() != n_hidden {
                let found = if eps.nrows() != n_hidden { eps.nrows() } else { eps.ncols() };
                return Err(HmmError::mismatch(n_hidden, found).at_seq(k).at_step(t));
            }
            if !eps.iter().all(is_prob) {
                return Err(HmmError::degenerate("Invalid transition probability").at_seq(k).at_step(t));
            }
        }
    }
    Ok(())
}

/// Occupancy mass of each state: the sum over all sequences of gamma over its time
/// axis, optionally leaving out the last step of each sequence.
fn occupancy(gammas : &[DMatrix<f64>], n_hidden : usize, span : OccupancySpan) -> DVector<f64> {
    let mut occ = DVector::zeros(n_hidden);
    for gamma in gammas {
        let steps = match span {
            OccupancySpan::AllSteps => gamma.nrows(),
            OccupancySpan::Transitions => gamma.nrows() - 1
        };
        for row in gamma.rows(0, steps).row_iter() {
            occ += row.transpose();
        }
    }
    occ
}

/// initial_prob[i] = (1/num) sum_k gammas[k][0][i]
fn reestimate_initial(gammas : &[DMatrix<f64>], n_hidden : usize) -> DVector<f64> {
    let mut initial = DVector::zeros(n_hidden);
    for gamma in gammas {
        initial += gamma.row(0).transpose();
    }
    initial.unscale_mut(gammas.len() as f64);
    initial
}

/// Expected transition counts divided, row by row, by the occupancy mass of the origin state.
fn reestimate_transition(
    epsilons : &[Vec<DMatrix<f64>>],
    occ : &DVector<f64>,
    n_hidden : usize
) -> Result<DMatrix<f64>, HmmError> {
    let mut counts = DMatrix::zeros(n_hidden, n_hidden);
    for epsilon in epsilons {
        for eps in epsilon {
            counts += eps;
        }
    }
    for (i, mut row) in counts.row_iter_mut().enumerate() {
        if occ[i] == 0.0 {
            return Err(HmmError::degenerate("Zero occupancy mass for transition estimate").at_state(i));
        }
        row.unscale_mut(occ[i]);
    }
    Ok(counts)
}

/// Occupancy-weighted sum of the observations assigned to state i, over all sequences.
fn weighted_sum(qs : &[DMatrix<f64>], gammas : &[DMatrix<f64>], i : usize) -> DVector<f64> {
    let mut sum = RowDVector::zeros(qs[0].ncols());
    for (q, gamma) in qs.iter().zip(gammas.iter()) {
        sum += gamma.column(i).transpose() * q;
    }
    sum.transpose()
}

/// Occupancy-weighted scatter of the observations around mu.
fn weighted_scatter(qs : &[DMatrix<f64>], gammas : &[DMatrix<f64>], i : usize, mu : &DVector<f64>) -> DMatrix<f64> {
    let p = mu.nrows();
    let mut scatter = DMatrix::zeros(p, p);
    for (q, gamma) in qs.iter().zip(gammas.iter()) {
        for (t, row) in q.row_iter().enumerate() {
            let diff = row.transpose() - mu;
            scatter.ger(gamma[(t, i)], &diff, &diff, 1.0);
        }
    }
    scatter
}

/// Computes the new chain and emission from the posteriors, without touching the current ones.
fn maximization_step(
    n_hidden : usize,
    n_dim : usize,
    qs : &[DMatrix<f64>],
    gammas : &[DMatrix<f64>],
    epsilons : &[Vec<DMatrix<f64>>],
    config : &EmConfig
) -> Result<(Chain, GaussianEmission), HmmError> {
    check_statistics(n_hidden, n_dim, qs, gammas, epsilons)?;
    let num = qs.len();

    let initial = reestimate_initial(gammas, n_hidden);

    let trans_occ = occupancy(gammas, n_hidden, config.transition_span);
    let transition = reestimate_transition(epsilons, &trans_occ, n_hidden)?;

    // Covariances (and occupancy-normalized means) are always divided by the mass over all steps.
    let occ = occupancy(gammas, n_hidden, OccupancySpan::AllSteps);
    let reg = config.covariance_regularizer(n_hidden);

    let mut components = Vec::with_capacity(n_hidden);
    for i in 0..n_hidden {
        let norm = match config.mean_normalization {
            MeanNormalization::SequenceCount => num as f64,
            MeanNormalization::Occupancy => occ[i]
        };
        if norm == 0.0 {
            return Err(HmmError::degenerate("Zero occupancy mass for mean estimate").at_state(i));
        }
        if occ[i] < reg {
            warn!("State {} is collapsing (occupancy mass {})", i, occ[i]);
        }
        let mu = weighted_sum(qs, gammas, i).unscale(norm);

        let mut sigma = weighted_scatter(qs, gammas, i, &mu)
            .unscale(occ[i] + reg);
        sigma = build_symmetric(sigma);
        for d in 0..n_dim {
            sigma[(d, d)] += config.min_covar;
        }
        if !mu.iter().chain(sigma.iter()).all(|v| v.is_finite() ) {
            return Err(HmmError::degenerate("Non-finite gaussian estimate").at_state(i));
        }
        trace!("State {}: occupancy = {}; mean = {}", i, occ[i], mu.transpose());
        components.push(MultiNormal::new(mu, sigma).map_err(|e| e.at_state(i) )?);
    }

    let substochastic = config.transition_span == OccupancySpan::AllSteps;
    let chain = Chain::from_estimates(initial, transition, substochastic)?;
    let emission = GaussianEmission::from_components(components)?;
    debug!("Re-estimated {} states from {} sequences; occupancy = {}", n_hidden, num, occ.transpose());
    Ok((chain, emission))
}
