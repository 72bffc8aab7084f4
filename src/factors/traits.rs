//! Factor interfaces used by Fisher blocks

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::Result;
use crate::thunk::DampingFunc;
use crate::KfacClient;

/// A named covariance estimate.
pub trait CovarianceFactor<R: Runtime<DType = DType>> {
    /// Stable name, unique within a collection.
    fn name(&self) -> &str;

    /// The covariance: a square matrix, or a vector for diagonal covariances.
    fn get_cov(&self) -> &Tensor<R>;
}

/// A factor that can multiply by damped powers of its covariance.
pub trait MatpowerFactor<R: Runtime<DType = DType>>: CovarianceFactor<R> {
    /// Declare that `(cov + damping·I)^exp` will be needed.
    fn register_matpower(&self, exp: f64, damping: &DampingFunc);

    /// `(cov + damping·I)^exp · x`.
    fn left_multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>>;

    /// `x · (cov + damping·I)^exp`.
    fn right_multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>>;
}

/// Quantities for the temporally-correlated series approximation.
pub trait SeriesFactor<R: Runtime<DType = DType>>: CovarianceFactor<R> {
    /// Compute and keep the lag-one cross moment.
    fn register_cov_dt1<C: KfacClient<R>>(&self, client: &C) -> Result<()>;

    /// The lag-one cross moment, once registered.
    fn get_cov_dt1(&self) -> Result<Tensor<R>>;

    fn register_option1quants(&self, damping: &DampingFunc);

    /// `(L, ψ)` for the given damping.
    fn get_option1quants(&self, damping: &DampingFunc) -> Result<(Tensor<R>, Tensor<R>)>;

    fn register_option2quants(&self, damping: &DampingFunc);

    /// `(P, K, μ)` for the given damping.
    fn get_option2quants(&self, damping: &DampingFunc)
        -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>;
}
