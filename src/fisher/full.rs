//! Blocks over the flattened parameter vector: full and naive-diagonal

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::debug;

use super::block::{already_instantiated, no_towers, not_instantiated, FisherBlock};
use super::towers::BatchSizeTowers;
use crate::error::Result;
use crate::factors::{
    CovarianceFactor, DiagonalFactor, FactorSpec, FullFactor, LayerCollection, MatpowerFactor,
};
use crate::thunk::{Damping, DampingFunc};
use crate::utils::host::diag_to_dense;
use crate::utils::{column_to_tensors, tensors_to_column, LayerParams, TrackedTensor};
use crate::KfacClient;

fn track_sources<R: Runtime<DType = DType>>(
    grads_list: &[LayerParams<R>],
) -> Vec<Vec<TrackedTensor<R>>> {
    grads_list
        .iter()
        .map(|source| source.tensors().iter().map(TrackedTensor::new).collect())
        .collect()
}

/// Exact covariance over all of a layer's parameters, flattened.
///
/// Only practical for small parameter groups: the block is `numel × numel`.
pub struct FullFB<R: Runtime> {
    params: LayerParams<R>,
    towers: BatchSizeTowers,
    factor: Option<(Arc<FullFactor<R>>, DampingFunc)>,
}

impl<R: Runtime<DType = DType>> FullFB<R> {
    pub fn new(params: LayerParams<R>) -> Self {
        Self {
            params,
            towers: BatchSizeTowers::default(),
            factor: None,
        }
    }

    pub fn register_additional_tower(&mut self, batch_size: usize) {
        self.towers.register(batch_size);
    }

    /// Sum of the registered tower batch sizes.
    pub fn batch_size(&self) -> usize {
        self.towers.batch_size()
    }

    fn state(&self) -> Result<&(Arc<FullFactor<R>>, DampingFunc)> {
        self.factor.as_ref().ok_or_else(|| not_instantiated("FullFB"))
    }

    /// The undamped covariance matrix.
    pub fn full_fisher_block(&self) -> Result<Tensor<R>> {
        Ok(self.state()?.0.get_cov().clone())
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for FullFB<R> {
    type Grads = [LayerParams<R>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[LayerParams<R>],
        damping: &Damping,
    ) -> Result<()> {
        if self.factor.is_some() {
            return Err(already_instantiated("FullFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("FullFB"));
        }
        let factor = collection.make_or_get_full(
            client,
            FactorSpec::Full {
                grads: track_sources(grads_list),
                batch_size: self.batch_size(),
            },
        )?;
        debug!(factor = factor.name(), "FullFB instantiated");
        self.factor = Some((factor, damping.to_func()));
        Ok(())
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        let (factor, damping) = self.state()?;
        factor.register_matpower(exp, damping);
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        let (factor, damping) = self.state()?;
        let column = tensors_to_column(client, vector)?;
        let out = factor.left_multiply_matpower(client, &column, exp, damping)?;
        column_to_tensors(vector, &out)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.params.tensors().iter().collect()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}

/// Diagonal of the covariance over all of a layer's parameters, flattened.
///
/// Uses the square of the summed per-batch gradient, so it is cheap but
/// ignores per-example structure.
pub struct NaiveDiagonalFB<R: Runtime> {
    params: LayerParams<R>,
    towers: BatchSizeTowers,
    factor: Option<(Arc<DiagonalFactor<R>>, DampingFunc)>,
}

impl<R: Runtime<DType = DType>> NaiveDiagonalFB<R> {
    pub fn new(params: LayerParams<R>) -> Self {
        Self {
            params,
            towers: BatchSizeTowers::default(),
            factor: None,
        }
    }

    pub fn register_additional_tower(&mut self, batch_size: usize) {
        self.towers.register(batch_size);
    }

    pub fn batch_size(&self) -> usize {
        self.towers.batch_size()
    }

    fn state(&self) -> Result<&(Arc<DiagonalFactor<R>>, DampingFunc)> {
        self.factor
            .as_ref()
            .ok_or_else(|| not_instantiated("NaiveDiagonalFB"))
    }

    /// The undamped covariance as a dense diagonal matrix.
    pub fn full_fisher_block(&self) -> Result<Tensor<R>> {
        diag_to_dense(self.state()?.0.get_cov())
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for NaiveDiagonalFB<R> {
    type Grads = [LayerParams<R>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[LayerParams<R>],
        damping: &Damping,
    ) -> Result<()> {
        if self.factor.is_some() {
            return Err(already_instantiated("NaiveDiagonalFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("NaiveDiagonalFB"));
        }
        let factor = collection.make_or_get_diagonal(
            client,
            FactorSpec::NaiveDiagonal {
                grads: track_sources(grads_list),
                batch_size: self.batch_size(),
            },
        )?;
        debug!(factor = factor.name(), "NaiveDiagonalFB instantiated");
        self.factor = Some((factor, damping.to_func()));
        Ok(())
    }

    fn register_matpower(&self, _exp: f64) -> Result<()> {
        // Elementwise powers are computed on demand.
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        let (factor, damping) = self.state()?;
        let column = tensors_to_column(client, vector)?;
        let out = factor.multiply_matpower(client, &column, exp, damping)?;
        column_to_tensors(vector, &out)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.params.tensors().iter().collect()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}
