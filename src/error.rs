use thiserror::Error;

/// Errors raised while building or stepping a controller.
///
/// Every variant is local to a single call: a failed step never commits
/// adaptive state, so the caller may hold the previous command and retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// Vehicle or controller parameters are physically meaningless.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The rotor layout produces a rank-deficient allocation matrix.
    #[error("allocation matrix is singular (condition ratio {ratio:e})")]
    SingularAllocation { ratio: f64 },

    /// A vector that must be normalized has (near) zero length.
    #[error("cannot normalize {what}: norm {norm:e} is below tolerance")]
    DegenerateVector { what: &'static str, norm: f64 },

    /// The adaptive layer was stepped at a rate different from its sample time.
    #[error("L1 step desynchronized: expected dt {expected} s, elapsed {elapsed} s")]
    StateDesync { expected: f64, elapsed: f64 },

    /// The measured state is not finite or the attitude is not a rotation.
    #[error("invalid vehicle state: {0}")]
    InvalidState(String),

    /// The external trajectory optimizer failed or returned a bad solution.
    #[error("optimizer error: {0}")]
    Optimizer(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
