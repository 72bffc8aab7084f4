//! Covariance factors and the collection that shares them between blocks

mod cache;
pub mod collection;
pub mod diagonal;
pub mod full;
pub mod kronecker;
pub(crate) mod stats;
pub mod traits;

pub use collection::{FactorKey, FactorKind, FactorRef, FactorSpec, LayerCollection};
pub use diagonal::DiagonalFactor;
pub use full::FullFactor;
pub use kronecker::KroneckerFactor;
pub use traits::{CovarianceFactor, MatpowerFactor, SeriesFactor};
