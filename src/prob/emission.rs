use nalgebra::*;
use super::*;
use serde::{Serialize, Deserialize};
use std::convert::TryFrom;

/// Gaussian emissions of a hidden Markov model: one MultiNormal per hidden state,
/// all sharing the same observation dimensionality. Each component caches its own
/// precision matrix and log-determinant, so replacing a component (which is the
/// only way to change a covariance) refreshes both at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<MultiNormal>", into = "Vec<MultiNormal>")]
pub struct GaussianEmission {
    components : Vec<MultiNormal>
}

impl GaussianEmission {

    /// Builds the emissions from an n_hidden x n_dim matrix of means (one state per row)
    /// and one n_dim x n_dim covariance per state. Any shape disagreement or
    /// singular covariance is reported as InvalidParameters tagged with the state.
    pub fn new(means : &DMatrix<f64>, covs : Vec<DMatrix<f64>>) -> Result<Self, HmmError> {
        if means.nrows() != covs.len() {
            return Err(HmmError::invalid(format!(
                "{} mean vectors informed for {} covariance matrices",
                means.nrows(),
                covs.len()
            )));
        }
        let mut components = Vec::with_capacity(covs.len());
        for (i, cov) in covs.into_iter().enumerate() {
            let mu = means.row(i).transpose();
            let mn = MultiNormal::new(mu, cov)
                .map_err(|e| as_invalid(e).at_state(i) )?;
            components.push(mn);
        }
        Self::from_components(components)
    }

    /// Wraps already-built components, verifying there is at least one and that
    /// all of them have the same dimensionality.
    pub fn from_components(components : Vec<MultiNormal>) -> Result<Self, HmmError> {
        let first = components.first()
            .ok_or_else(|| HmmError::invalid("At least one hidden state is required") )?;
        let n_dim = first.dim();
        for (i, c) in components.iter().enumerate() {
            if c.dim() != n_dim {
                return Err(HmmError::InvalidParameters {
                    reason : format!("Expected dimension {}, found {}", n_dim, c.dim()),
                    at : Location::state(i)
                });
            }
        }
        Ok(Self { components })
    }

    pub fn components(&self) -> &[MultiNormal] {
        &self.components[..]
    }

    pub fn component(&self, i : usize) -> Option<&MultiNormal> {
        self.components.get(i)
    }

    /// Means arranged as an n_hidden x n_dim matrix (one state per row).
    pub fn means(&self) -> DMatrix<f64> {
        let n_dim = self.n_dim();
        DMatrix::from_fn(self.components.len(), n_dim, |i, j| self.components[i].mean()[j] )
    }

    fn check_sequence(&self, seq : &DMatrixSlice<'_, f64>) -> Result<(), HmmError> {
        if seq.ncols() != self.n_dim() {
            Err(HmmError::mismatch(self.n_dim(), seq.ncols()))
        } else {
            Ok(())
        }
    }

    /// Fills a T x n_hidden matrix with f(component, observation) for every pair,
    /// tagging failures with the state and timestep.
    fn eval<F>(&self, seq : DMatrixSlice<'_, f64>, f : F) -> Result<DMatrix<f64>, HmmError>
    where
        F : Fn(&MultiNormal, DMatrixSlice<'_, f64>) -> Result<f64, HmmError>
    {
        self.check_sequence(&seq)?;
        let mut b = DMatrix::zeros(seq.nrows(), self.components.len());
        for t in 0..seq.nrows() {
            for (i, c) in self.components.iter().enumerate() {
                b[(t, i)] = f(c, seq.rows(t, 1)).map_err(|e| e.at_state(i).at_step(t) )?;
            }
        }
        Ok(b)
    }

}

fn as_invalid(e : HmmError) -> HmmError {
    match e {
        HmmError::InvalidParameters { .. } => e,
        HmmError::SingularCovariance { at } => HmmError::InvalidParameters {
            reason : String::from("Covariance matrix is singular or not positive-definite"),
            at
        },
        other => HmmError::InvalidParameters { reason : other.to_string(), at : Location::none() }
    }
}

impl Emission for GaussianEmission {

    fn n_hidden(&self) -> usize {
        self.components.len()
    }

    fn n_dim(&self) -> usize {
        self.components[0].dim()
    }

    fn likelihood(&self, seq : DMatrixSlice<'_, f64>) -> Result<DMatrix<f64>, HmmError> {
        self.eval(seq, |c, x| c.prob(&x) )
    }

    fn log_likelihood(&self, seq : DMatrixSlice<'_, f64>) -> Result<DMatrix<f64>, HmmError> {
        self.eval(seq, |c, x| c.log_prob(&x) )
    }

}

impl TryFrom<Vec<MultiNormal>> for GaussianEmission {

    type Error = HmmError;

    fn try_from(components : Vec<MultiNormal>) -> Result<Self, HmmError> {
        GaussianEmission::from_components(components)
    }

}

impl From<GaussianEmission> for Vec<MultiNormal> {

    fn from(em : GaussianEmission) -> Self {
        em.components
    }

}
