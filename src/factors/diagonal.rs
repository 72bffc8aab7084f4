//! Diagonal covariance factors
//!
//! The diagonal is stored in the shape of the vector it multiplies: a
//! `[numel, 1]` column for naive factors, `[fan_in(+1), fan_out]` for
//! fully-connected and conv layers. Powers are elementwise, so no exponent
//! has to be registered ahead of time.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::cache::PowerCache;
use super::full::source_column;
use super::stats::{as_matrix, conv_patches, design_matrix};
use super::traits::CovarianceFactor;
use crate::error::{Error, Result};
use crate::thunk::DampingFunc;
use crate::utils::host::{from_host, to_host};
use crate::utils::{ConvGeometry, PartitionedTensor, TrackedTensor};
use crate::KfacClient;

/// `Σ_sources mean_towers f(input_tower, grad_tower)`.
fn paired_towers<R, C, F>(
    client: &C,
    inputs: &[PartitionedTensor<R>],
    grads: &[Vec<PartitionedTensor<R>>],
    mut f: F,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
    F: FnMut(&PartitionedTensor<R>, &PartitionedTensor<R>) -> Result<Tensor<R>>,
{
    let num_towers = inputs.len();
    if num_towers == 0 || grads.is_empty() || grads.iter().any(|g| g.len() != num_towers) {
        return Err(Error::InvalidArgument {
            arg: "grads_list",
            reason: format!(
                "every gradient source needs one entry per input tower ({num_towers})"
            ),
        });
    }
    let mut total: Option<Tensor<R>> = None;
    for (tower, input) in inputs.iter().enumerate() {
        for source in grads {
            let contrib = f(input, &source[tower])?;
            total = Some(match total {
                Some(acc) => client.add(&acc, &contrib)?,
                None => contrib,
            });
        }
    }
    let total = total.ok_or_else(|| Error::InvalidArgument {
        arg: "inputs",
        reason: "no data".to_string(),
    })?;
    Ok(client.mul_scalar(&total, 1.0 / num_towers as f64)?)
}

fn check_rows(inputs: usize, grads: usize) -> Result<()> {
    if inputs != grads {
        return Err(Error::InvalidArgument {
            arg: "grads_list",
            reason: format!("inputs have {inputs} rows but gradients have {grads}"),
        });
    }
    Ok(())
}

/// Diagonal approximation of a covariance.
pub struct DiagonalFactor<R: Runtime> {
    name: String,
    cov: Tensor<R>,
    powers: PowerCache<Tensor<R>>,
}

impl<R: Runtime<DType = DType>> DiagonalFactor<R> {
    fn new(name: String, cov: Tensor<R>) -> Self {
        Self {
            name,
            cov,
            powers: PowerCache::default(),
        }
    }

    /// `Σ_sources g² / batch_size` over flattened gradients.
    pub(crate) fn naive<C: KfacClient<R>>(
        client: &C,
        name: String,
        grads: &[Vec<TrackedTensor<R>>],
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument {
                arg: "batch_size",
                reason: "diagonal covariance needs a nonzero batch size".to_string(),
            });
        }
        let mut total: Option<Tensor<R>> = None;
        for source in grads {
            let sq = client.square(&source_column(client, source)?)?;
            total = Some(match total {
                Some(acc) => client.add(&acc, &sq)?,
                None => sq,
            });
        }
        let total = total.ok_or_else(|| Error::InvalidArgument {
            arg: "grads_list",
            reason: "no gradient sources".to_string(),
        })?;
        let cov = client.mul_scalar(&total, 1.0 / batch_size as f64)?;
        Ok(Self::new(name, cov))
    }

    /// Per-example squared gradients of a dense layer:
    /// `mean_n (a_n ⊗ g_n)² = (a²)ᵀ (g²) / N`.
    pub(crate) fn fully_connected<C: KfacClient<R>>(
        client: &C,
        name: String,
        inputs: &[PartitionedTensor<R>],
        grads: &[Vec<PartitionedTensor<R>>],
        has_bias: bool,
    ) -> Result<Self> {
        let cov = paired_towers(client, inputs, grads, |input, grad| {
            let a = design_matrix(client, input, has_bias)?;
            let g = as_matrix(&grad.materialize(client)?)?;
            check_rows(a.shape()[0], g.shape()[0])?;
            let n = a.shape()[0] as f64;
            let a2 = client.square(&a)?;
            let g2 = client.square(&g)?;
            let prod = client.matmul(&a2.transpose(-2, -1)?, &g2)?;
            Ok(client.mul_scalar(&prod, 1.0 / n)?)
        })?;
        Ok(Self::new(name, cov))
    }

    /// Per-example squared gradients of a conv layer, where each example's
    /// gradient sums patch ⊗ output-gradient over all spatial locations.
    pub(crate) fn conv<C: KfacClient<R>>(
        client: &C,
        name: String,
        inputs: &[PartitionedTensor<R>],
        grads: &[Vec<PartitionedTensor<R>>],
        geometry: &ConvGeometry,
        has_bias: bool,
    ) -> Result<Self> {
        let cov = paired_towers(client, inputs, grads, |input, grad| {
            let batch = input.shape()[0];
            let patches = conv_patches(client, input, geometry, has_bias)?;
            let g = as_matrix(&grad.materialize(client)?)?;
            let (rows, k) = (patches.shape()[0], patches.shape()[1]);
            check_rows(rows, g.shape()[0])?;
            if batch == 0 || rows % batch != 0 {
                return Err(Error::InvalidArgument {
                    arg: "inputs",
                    reason: format!("{rows} patch rows do not split into {batch} examples"),
                });
            }
            let locations = rows / batch;
            let cout = g.shape()[1];
            let p = patches.reshape(&[batch, locations, k])?;
            let g = g.contiguous()?.reshape(&[batch, locations, cout])?;
            let per_example = client.matmul(&p.transpose(-2, -1)?, &g)?;
            let sq = client.square(&per_example)?;
            let summed = client.sum(&sq, &[0], false)?;
            Ok(client.mul_scalar(&summed, 1.0 / batch as f64)?)
        })?;
        Ok(Self::new(name, cov))
    }

    /// `x ⊙ (cov + damping)^exp`.
    pub fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        x: &Tensor<R>,
        exp: f64,
        damping: &DampingFunc,
    ) -> Result<Tensor<R>> {
        if x.shape() != self.cov.shape() {
            return Err(Error::InvalidArgument {
                arg: "vector",
                reason: format!(
                    "shape {:?} does not match diagonal of shape {:?}",
                    x.shape(),
                    self.cov.shape()
                ),
            });
        }
        let power = self
            .powers
            .get_or_compute(&self.name, exp, damping, false, |d| {
                let diag = to_host(&self.cov)?;
                let powered: Vec<f64> = diag.iter().map(|v| (v + d).powf(exp)).collect();
                from_host::<R>(&powered, self.cov.shape(), self.cov.device())
            })?;
        Ok(client.mul(x, &power)?)
    }
}

impl<R: Runtime<DType = DType>> CovarianceFactor<R> for DiagonalFactor<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_cov(&self) -> &Tensor<R> {
        &self.cov
    }
}
