/// Multivariate normal densities and the emission models built from them.
pub mod prob;

/// Discrete Markov chain holding the initial and transition probabilities
/// of the hidden states.
pub mod markov;

/// Expectation maximization (Baum-Welch) parameter re-estimation for hidden
/// Markov models with multivariate gaussian emissions.
pub mod fit;

pub use prob::{HmmError, Location, Emission, MultiNormal, GaussianEmission, density};

pub use markov::Chain;

pub use fit::{GaussianHmm, EmConfig, MeanNormalization, OccupancySpan};
