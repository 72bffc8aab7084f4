//! kfacr error types

use numr::dtype::DType;

/// kfacr result type
pub type Result<T> = std::result::Result<T, Error>;

/// kfacr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Configuration value outside the allowed set, or a config file that failed to load
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// Description of what went wrong
        reason: String,
    },

    /// Number of parameter uses is inconsistent or cannot be determined
    #[error("use count error: {reason}")]
    UseCount {
        /// Description of what went wrong
        reason: String,
    },

    /// Feature not supported by this block type
    #[error("unsupported: {feature}")]
    Unsupported {
        /// What was requested
        feature: String,
    },

    /// Operation called in the wrong lifecycle state
    #[error("invalid state: {reason}")]
    State {
        /// Description of what went wrong
        reason: String,
    },

    /// DType mismatch for curvature statistics
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },
}
