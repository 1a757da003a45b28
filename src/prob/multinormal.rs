use nalgebra::*;
use super::*;
use serde::{Serialize, Deserialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};
use std::convert::TryFrom;
use rand::Rng;
use rand_distr::StandardNormal;

/// Absolute tolerance (scaled by the largest covariance entry) for the symmetry check.
const SYMM_EPS : f64 = 1E-9;

/// Smallest admissible ratio between the smallest and largest diagonal entries
/// of the Cholesky factor. Below this the covariance is numerically singular.
const COND_EPS : f64 = 1E-10;

/// Plain (μ, Σ) pair, used as the serialized form of MultiNormal. The derived
/// quantities are always rebuilt on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalParams {

    pub mu : DVector<f64>,

    pub sigma : DMatrix<f64>

}

/// Multivariate normal parametrized by μ (px1) and Σ (pxp). While the public API always
/// works by receiving covariance matrices, this structure holds the covariance, its
/// lower Cholesky factor, the precision (inverse covariance) matrix and the log-determinant
/// of the covariance internally. Those are derived quantities: they are computed once
/// when the covariance is set, and a MultiNormal with a covariance that cannot be
/// factorized is never built, so evaluating the density never touches a stale or
/// singular precision matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "NormalParams", into = "NormalParams")]
pub struct MultiNormal {

    mu : DVector<f64>,

    sigma : DMatrix<f64>,

    /// Lower-triangular L such that Σ = L L^T.
    sigma_chol : DMatrix<f64>,

    sigma_inv : DMatrix<f64>,

    /// ln |Σ|
    log_det : f64

}

impl MultiNormal {

    /// Builds a new multivariate distribution from a mu vector and a positive-definite
    /// covariance matrix sigma.
    pub fn new(mu : DVector<f64>, sigma : DMatrix<f64>) -> Result<Self, HmmError> {
        if mu.nrows() == 0 {
            return Err(HmmError::invalid("Empty mean vector"));
        }
        if sigma.nrows() != sigma.ncols() {
            return Err(HmmError::mismatch(sigma.nrows(), sigma.ncols()));
        }
        if mu.nrows() != sigma.nrows() {
            return Err(HmmError::mismatch(mu.nrows(), sigma.nrows()));
        }
        if !mu.iter().all(|m| m.is_finite() ) {
            return Err(HmmError::invalid("Mean vector has non-finite entries"));
        }
        if !sigma.iter().all(|s| s.is_finite() ) || !is_symmetric(&sigma) {
            return Err(HmmError::SingularCovariance { at : Location::none() });
        }
        let (sigma_chol, sigma_inv, log_det) = factorize(&sigma)?;
        Ok(Self { mu, sigma, sigma_chol, sigma_inv, log_det })
    }

    /// Creates a centered multinormal with identity covariance of size p.
    pub fn new_standard(p : usize) -> Result<Self, HmmError> {
        Self::new(DVector::zeros(p), DMatrix::identity(p, p))
    }

    /// Creates a non-centered multinormal with diagonal covariance var * I.
    pub fn new_homoscedastic(mu : DVector<f64>, var : f64) -> Result<Self, HmmError> {
        let n = mu.nrows();
        let mut cov = DMatrix::zeros(n, n);
        cov.set_diagonal(&DVector::from_element(n, var));
        Self::new(mu, cov)
    }

    pub fn dim(&self) -> usize {
        self.mu.nrows()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mu
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.sigma
    }

    /// Inverse of the covariance matrix.
    pub fn precision(&self) -> &DMatrix<f64> {
        &self.sigma_inv
    }

    /// Natural log of the covariance determinant.
    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    /// Squared Mahalanobis distance (x-μ)^T Σ^-1 (x-μ). The observation can be
    /// any one-dimensional view (a row of a sequence matrix or a column vector).
    pub fn mahalanobis<R, C, S>(&self, x : &Matrix<f64, R, C, S>) -> Result<f64, HmmError>
    where
        R : Dim,
        C : Dim,
        S : Storage<f64, R, C>
    {
        if x.nrows() != 1 && x.ncols() != 1 {
            return Err(HmmError::mismatch(1, x.nrows().min(x.ncols())));
        }
        if x.len() != self.dim() {
            return Err(HmmError::mismatch(self.dim(), x.len()));
        }
        let diff = DVector::from_iterator(
            self.dim(),
            x.iter().zip(self.mu.iter()).map(|(xi, mi)| xi - mi )
        );
        Ok(diff.dot(&(&self.sigma_inv * &diff)))
    }

    /// Log-density of a single observation.
    pub fn log_prob<R, C, S>(&self, x : &Matrix<f64, R, C, S>) -> Result<f64, HmmError>
    where
        R : Dim,
        C : Dim,
        S : Storage<f64, R, C>
    {
        let quad = self.mahalanobis(x)?;
        let d = self.dim() as f64;
        Ok(-0.5 * (d * (2. * PI).ln() + self.log_det + quad))
    }

    /// Density of a single observation. Always non-negative; underflows to zero
    /// for observations very far from the mean (use log_prob for those).
    pub fn prob<R, C, S>(&self, x : &Matrix<f64, R, C, S>) -> Result<f64, HmmError>
    where
        R : Dim,
        C : Dim,
        S : Storage<f64, R, C>
    {
        self.log_prob(x).map(f64::exp)
    }

    /// Draws n independent observations (arranged over rows) as μ + L z, with z
    /// a vector of independent standard normals.
    pub fn sample<G>(&self, rng : &mut G, n : usize) -> DMatrix<f64>
    where
        G : Rng + ?Sized
    {
        let p = self.dim();
        let mut out = DMatrix::zeros(n, p);
        for mut row in out.row_iter_mut() {
            let z = DVector::<f64>::from_fn(p, |_, _| rng.sample(StandardNormal) );
            let x = &self.mu + &self.sigma_chol * z;
            row.copy_from(&x.transpose());
        }
        out
    }

}

impl TryFrom<NormalParams> for MultiNormal {

    type Error = HmmError;

    fn try_from(p : NormalParams) -> Result<Self, HmmError> {
        MultiNormal::new(p.mu, p.sigma)
    }

}

impl From<MultiNormal> for NormalParams {

    fn from(mn : MultiNormal) -> Self {
        NormalParams { mu : mn.mu, sigma : mn.sigma }
    }

}

impl Display for MultiNormal {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MNorm({})", self.mu.nrows())
    }

}

/// Evaluates N(x; μ, Σ), factorizing Σ at every call. Prefer building a MultiNormal
/// once when the same parameters are evaluated against many observations.
pub fn density(mu : &DVector<f64>, sigma : &DMatrix<f64>, x : &DVector<f64>) -> Result<f64, HmmError> {
    MultiNormal::new(mu.clone(), sigma.clone())?.prob(x)
}

/// Returns (L, Σ^-1, ln|Σ|) for a symmetric matrix, or SingularCovariance
/// if Σ is not (numerically) positive-definite.
fn factorize(sigma : &DMatrix<f64>) -> Result<(DMatrix<f64>, DMatrix<f64>, f64), HmmError> {
    let chol = Cholesky::new(sigma.clone())
        .ok_or(HmmError::SingularCovariance { at : Location::none() })?;
    let l = chol.l();
    let diag = l.diagonal();
    let max_d = diag.max();
    let min_d = diag.min();
    if !(min_d > 0.) || !max_d.is_finite() || min_d / max_d < COND_EPS {
        return Err(HmmError::SingularCovariance { at : Location::none() });
    }
    let log_det = 2. * diag.iter().map(|d| d.ln() ).sum::<f64>();
    let sigma_inv = build_symmetric(chol.inverse());
    Ok((l, sigma_inv, log_det))
}

fn is_symmetric(m : &DMatrix<f64>) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    let scale = m.amax().max(1.);
    (m - m.transpose()).amax() <= SYMM_EPS * scale
}

/// Verifies if the informed matrix is square, symmetric and admits a Cholesky
/// factorization with a non-degenerate diagonal.
pub fn is_pd(m : &DMatrix<f64>) -> bool {
    is_symmetric(m) && factorize(m).is_ok()
}

/// Builds a symmetric matrix from M as (1/2)*(M + M^T)
pub fn build_symmetric(m : DMatrix<f64>) -> DMatrix<f64> {
    assert!(m.nrows() == m.ncols(), "build_symmetric: Informed non-square matrix");
    let mt = m.transpose();
    (m + mt).scale(0.5)
}
