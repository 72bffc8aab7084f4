//! Kronecker factors: input-side and output-side covariances of a layer
//!
//! A Kronecker-factored block approximates `F ≈ c · (A ⊗ G)` where `A` is the
//! second moment of the layer's inputs (or image patches, or one-hot
//! embedding ids) and `G` the second moment of the gradients with respect to
//! its outputs. Multi-use factors additionally keep the per-tower data so the
//! lag-one cross moment between consecutive uses can be estimated.

use std::sync::Mutex;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::cache::PowerCache;
use super::stats::{
    conv_patches, design_matrix, lag_one_moment, mean_towers, second_moment,
    sum_sources_mean_towers,
};
use super::traits::{CovarianceFactor, MatpowerFactor, SeriesFactor};
use crate::error::{Error, Result};
use crate::thunk::DampingFunc;
use crate::utils::host::{from_host, ids_to_host, to_host};
use crate::utils::linalg::{damped_matpower, series_option1, series_option2};
use crate::utils::{ConvGeometry, PartitionedTensor};
use crate::KfacClient;

/// Design matrices retained for lag-one statistics, `[source][tower]`.
struct SeriesData<R: Runtime> {
    matrices: Vec<Vec<Tensor<R>>>,
    num_uses: usize,
}

type Option1Quants<R> = (Tensor<R>, Tensor<R>);
type Option2Quants<R> = (Tensor<R>, Tensor<R>, Tensor<R>);

/// One side of a Kronecker-factored block.
pub struct KroneckerFactor<R: Runtime> {
    name: String,
    cov: Tensor<R>,
    diagonal: bool,
    series: Option<SeriesData<R>>,
    cov_dt1: Mutex<Option<Tensor<R>>>,
    powers: PowerCache<Tensor<R>>,
    option1: PowerCache<Option1Quants<R>>,
    option2: PowerCache<Option2Quants<R>>,
}

impl<R: Runtime<DType = DType>> KroneckerFactor<R> {
    fn new(name: String, cov: Tensor<R>, diagonal: bool, series: Option<SeriesData<R>>) -> Self {
        Self {
            name,
            cov,
            diagonal,
            series,
            cov_dt1: Mutex::new(None),
            powers: PowerCache::default(),
            option1: PowerCache::default(),
            option2: PowerCache::default(),
        }
    }

    /// `Σ_sources mean_towers xᵀx / rows` for dense-layer inputs or output gradients.
    pub(crate) fn fully_connected<C: KfacClient<R>>(
        client: &C,
        name: String,
        sources: &[Vec<PartitionedTensor<R>>],
        has_bias: bool,
    ) -> Result<Self> {
        let cov = sum_sources_mean_towers(client, sources, |data| {
            second_moment(client, &design_matrix(client, data, has_bias)?)
        })?;
        Ok(Self::new(name, cov, false, None))
    }

    /// Like [`fully_connected`](Self::fully_connected) over use-folded data,
    /// keeping the data for lag-one statistics across `num_uses` uses.
    pub(crate) fn fully_connected_multi<C: KfacClient<R>>(
        client: &C,
        name: String,
        sources: &[Vec<PartitionedTensor<R>>],
        num_uses: usize,
        has_bias: bool,
    ) -> Result<Self> {
        let matrices = sources
            .iter()
            .map(|towers| {
                towers
                    .iter()
                    .map(|data| design_matrix(client, data, has_bias))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let num_towers = matrices.first().map_or(0, Vec::len);
        if num_towers == 0 || matrices.iter().any(|m| m.len() != num_towers) {
            return Err(Error::InvalidArgument {
                arg: "sources",
                reason: "every source needs the same, nonzero, number of towers".to_string(),
            });
        }

        let mut total: Option<Tensor<R>> = None;
        for x in matrices.iter().flatten() {
            let m = second_moment(client, x)?;
            total = Some(match total {
                Some(acc) => client.add(&acc, &m)?,
                None => m,
            });
        }
        let total = total.ok_or_else(|| Error::InvalidArgument {
            arg: "sources",
            reason: "no data".to_string(),
        })?;
        let cov = client.mul_scalar(&total, 1.0 / num_towers as f64)?;
        Ok(Self::new(
            name,
            cov,
            false,
            Some(SeriesData { matrices, num_uses }),
        ))
    }

    /// Second moment of image patches, `mean_towers PᵀP / rows`.
    pub(crate) fn conv_input<C: KfacClient<R>>(
        client: &C,
        name: String,
        inputs: &[PartitionedTensor<R>],
        geometry: &ConvGeometry,
        has_bias: bool,
    ) -> Result<Self> {
        let cov = mean_towers(client, inputs, |data| {
            second_moment(client, &conv_patches(client, data, geometry, has_bias)?)
        })?;
        Ok(Self::new(name, cov, false, None))
    }

    /// Second moment of per-location output gradients.
    pub(crate) fn conv_output<C: KfacClient<R>>(
        client: &C,
        name: String,
        grads: &[Vec<PartitionedTensor<R>>],
    ) -> Result<Self> {
        Self::fully_connected(client, name, grads, false)
    }

    /// Diagonal second moment of one-hot ids: the frequency of each id.
    pub(crate) fn embedding_input<C: KfacClient<R>>(
        client: &C,
        name: String,
        inputs: &[PartitionedTensor<R>],
        vocab_size: usize,
    ) -> Result<Self> {
        let cov = mean_towers(client, inputs, |data| {
            let t = data.materialize(client)?;
            let ids = ids_to_host(&t)?;
            if ids.is_empty() {
                return Err(Error::InvalidArgument {
                    arg: "inputs",
                    reason: "no embedding ids".to_string(),
                });
            }
            let mut counts = vec![0.0; vocab_size];
            for &id in &ids {
                let slot = usize::try_from(id)
                    .ok()
                    .filter(|&i| i < vocab_size)
                    .ok_or_else(|| Error::InvalidArgument {
                        arg: "inputs",
                        reason: format!("id {id} outside vocabulary of size {vocab_size}"),
                    })?;
                counts[slot] += 1.0;
            }
            let n = ids.len() as f64;
            counts.iter_mut().for_each(|c| *c /= n);
            from_host::<R>(&counts, &[vocab_size], t.device())
        })?;
        Ok(Self::new(name, cov, true, None))
    }

    /// True when the covariance is stored as its diagonal.
    pub fn is_diagonal(&self) -> bool {
        self.diagonal
    }

    pub fn dim(&self) -> usize {
        self.cov.shape()[0]
    }

    /// Number of damped powers currently held.
    pub fn num_cached_powers(&self) -> usize {
        self.powers.len()
    }

    fn num_uses(&self) -> Result<usize> {
        self.series
            .as_ref()
            .map(|s| s.num_uses)
            .ok_or_else(|| Error::State {
                reason: format!("factor {} was not built from multi-use data", self.name),
            })
    }

    fn matpower(&self, exp: f64, damping: &DampingFunc) -> Result<Tensor<R>> {
        self.powers
            .get_or_compute(&self.name, exp, damping, true, |d| {
                let n = self.dim();
                let cov = to_host(&self.cov)?;
                if self.diagonal {
                    let powered: Vec<f64> = cov.iter().map(|v| (v + d).powf(exp)).collect();
                    from_host::<R>(&powered, &[n], self.cov.device())
                } else {
                    let power = damped_matpower(&cov, n, d, exp);
                    from_host::<R>(&power, &[n, n], self.cov.device())
                }
            })
    }

    fn series_inputs(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let dt1 = self.get_cov_dt1()?;
        Ok((to_host(&self.cov)?, to_host(&dt1)?))
    }
}

impl<R: Runtime<DType = DType>> CovarianceFactor<R> for KroneckerFactor<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_cov(&self) -> &Tensor<R> {
        &self.cov
    }
}

impl<R: Runtime<DType = DType>> MatpowerFactor<R> for KroneckerFactor<R> {
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
        if self.diagonal {
            let col = m.reshape(&[self.dim(), 1])?;
            Ok(client.mul(&col, x)?)
        } else {
            Ok(client.matmul(&m, x)?)
        }
    }

    fn right_multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>> {
        let m = self.matpower(exp, damping)?;
        if self.diagonal {
            let row = m.reshape(&[1, self.dim()])?;
            Ok(client.mul(x, &row)?)
        } else {
            Ok(client.matmul(x, &m)?)
        }
    }
}

impl<R: Runtime<DType = DType>> SeriesFactor<R> for KroneckerFactor<R> {
    fn register_cov_dt1<C: KfacClient<R>>(&self, client: &C) -> Result<()> {
        let mut slot = self.cov_dt1.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let num_uses = self.num_uses()?;
        let Some(series) = self.series.as_ref() else {
            return Err(Error::State {
                reason: format!("factor {} has no multi-use data", self.name),
            });
        };
        let num_towers = series.matrices.first().map_or(1, Vec::len);
        let mut total: Option<Tensor<R>> = None;
        for x in series.matrices.iter().flatten() {
            let m = lag_one_moment(client, x, num_uses)?;
            total = Some(match total {
                Some(acc) => client.add(&acc, &m)?,
                None => m,
            });
        }
        let total = total.ok_or_else(|| Error::State {
            reason: format!("factor {} has no multi-use data", self.name),
        })?;
        *slot = Some(client.mul_scalar(&total, 1.0 / num_towers as f64)?);
        Ok(())
    }

    fn get_cov_dt1(&self) -> Result<Tensor<R>> {
        self.cov_dt1
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::State {
                reason: format!("lag-one moment of factor {} was never registered", self.name),
            })
    }

    fn register_option1quants(&self, _damping: &DampingFunc) {
        self.option1.register(-1.0);
    }

    fn get_option1quants(&self, damping: &DampingFunc) -> Result<Option1Quants<R>> {
        self.option1
            .get_or_compute(&self.name, -1.0, damping, true, |d| {
                let (cov, dt1) = self.series_inputs()?;
                let n = self.dim();
                let (l, psi) = series_option1(&cov, &dt1, n, d);
                let device = self.cov.device();
                Ok((
                    from_host::<R>(&l, &[n, n], device)?,
                    from_host::<R>(&psi, &[n], device)?,
                ))
            })
    }

    fn register_option2quants(&self, _damping: &DampingFunc) {
        self.option2.register(-1.0);
    }

    fn get_option2quants(&self, damping: &DampingFunc) -> Result<Option2Quants<R>> {
        self.option2
            .get_or_compute(&self.name, -1.0, damping, true, |d| {
                let (cov, dt1) = self.series_inputs()?;
                let n = self.dim();
                let (p, k, mu) = series_option2(&cov, &dt1, n, d);
                let device = self.cov.device();
                Ok((
                    from_host::<R>(&p, &[n, n], device)?,
                    from_host::<R>(&k, &[n, n], device)?,
                    from_host::<R>(&mu, &[n], device)?,
                ))
            })
    }
}
