//! Full covariance over a flattened parameter vector

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::cache::PowerCache;
use super::traits::{CovarianceFactor, MatpowerFactor};
use crate::error::{Error, Result};
use crate::thunk::DampingFunc;
use crate::utils::host::{from_host, to_host};
use crate::utils::linalg::damped_matpower;
use crate::utils::{tensors_to_column, LayerParams, TrackedTensor};
use crate::KfacClient;

/// Column of one source's parameter gradients.
pub(crate) fn source_column<R, C>(client: &C, grads: &[TrackedTensor<R>]) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let params = LayerParams::from_tensors(grads.iter().map(|g| g.tensor().clone()).collect());
    tensors_to_column(client, &params)
}

/// `Σ_sources g gᵀ / batch_size` over the flattened gradients.
pub struct FullFactor<R: Runtime> {
    name: String,
    cov: Tensor<R>,
    powers: PowerCache<Tensor<R>>,
}

impl<R: Runtime<DType = DType>> FullFactor<R> {
    pub(crate) fn from_grads<C: KfacClient<R>>(
        client: &C,
        name: String,
        grads: &[Vec<TrackedTensor<R>>],
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "full covariance needs a nonzero batch size".to_string(),
            });
        }
        let mut total: Option<Tensor<R>> = None;
        for source in grads {
            let g = source_column(client, source)?;
            let outer = client.matmul(&g, &g.transpose(-2, -1)?)?;
            total = Some(match total {
                Some(acc) => client.add(&acc, &outer)?,
                None => outer,
            });
        }
        let total = total.ok_or_else(|| Error::InvalidArgument {
            arg: "grads_list",
            reason: "no gradient sources".to_string(),
        })?;
        let cov = client.mul_scalar(&total, 1.0 / batch_size as f64)?;
        Ok(Self {
            name,
            cov,
            powers: PowerCache::default(),
        })
    }

    fn dim(&self) -> usize {
        self.cov.shape()[0]
    }

    fn matpower(&self, exp: f64, damping: &DampingFunc) -> Result<Tensor<R>> {
        self.powers
            .get_or_compute(&self.name, exp, damping, true, |d| {
                let n = self.dim();
                let cov = to_host(&self.cov)?;
                let power = damped_matpower(&cov, n, d, exp);
                from_host::<R>(&power, &[n, n], self.cov.device())
            })
    }
}

impl<R: Runtime<DType = DType>> CovarianceFactor<R> for FullFactor<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_cov(&self) -> &Tensor<R> {
        &self.cov
    }
}

impl<R: Runtime<DType = DType>> MatpowerFactor<R> for FullFactor<R> {
    fn register_matpower(&self, exp: f64, _damping: &DampingFunc) {
        self.powers.register(exp);
    }

    fn left_multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>> {
        let m = self.matpower(exp, damping)?;
        Ok(client.matmul(&m, x)?)
    }

    fn right_multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>> {
        let m = self.matpower(exp, damping)?;
        Ok(client.matmul(x, &m)?)
    }
}
