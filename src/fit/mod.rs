/// Baum-Welch re-estimation of hidden Markov models with gaussian emissions.
/// The forward-backward recursion that produces the occupancy and transition
/// posteriors is left to the caller: this module consumes them.
mod em;

pub use em::*;

/// Tuning of the maximization step, loadable from JSON.
mod config;

pub use config::*;
