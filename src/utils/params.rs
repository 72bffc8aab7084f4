//! Layer parameter groupings and their 2-D / column views
//!
//! Curvature blocks see a layer's parameters (and vectors shaped like them)
//! either as a `[fan_in(+1), fan_out]` matrix (Kronecker and diagonal blocks)
//! or as a single column (full and naive-diagonal blocks).

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::KfacClient;

/// The parameters of one layer: weights, optionally followed by a bias,
/// or an arbitrary list of tensors for blocks that flatten everything.
pub struct LayerParams<R: Runtime> {
    tensors: Vec<Tensor<R>>,
}

impl<R: Runtime> Clone for LayerParams<R> {
    fn clone(&self) -> Self {
        Self {
            tensors: self.tensors.clone(),
        }
    }
}

impl<R: Runtime> std::fmt::Debug for LayerParams<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shapes: Vec<&[usize]> = self.tensors.iter().map(|t| t.shape()).collect();
        f.debug_struct("LayerParams").field("shapes", &shapes).finish()
    }
}

impl<R: Runtime> LayerParams<R> {
    pub fn weights(weights: Tensor<R>) -> Self {
        Self {
            tensors: vec![weights],
        }
    }

    pub fn with_bias(weights: Tensor<R>, bias: Tensor<R>) -> Self {
        Self {
            tensors: vec![weights, bias],
        }
    }

    pub fn from_tensors(tensors: Vec<Tensor<R>>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[Tensor<R>] {
        &self.tensors
    }

    pub fn into_tensors(self) -> Vec<Tensor<R>> {
        self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// True for a `(weights, bias)` pair.
    pub fn has_bias(&self) -> bool {
        self.tensors.len() == 2
    }

    /// Shape of the weight tensor.
    pub fn weight_shape(&self) -> Result<&[usize]> {
        self.tensors
            .first()
            .map(|t| t.shape())
            .ok_or_else(|| Error::InvalidArgument {
                arg: "params",
                reason: "layer has no parameter tensors".to_string(),
            })
    }

    /// Total number of scalar parameters.
    pub fn numel(&self) -> usize {
        self.tensors.iter().map(|t| t.numel()).sum()
    }
}

fn weight_rows(shape: &[usize]) -> Result<(usize, usize)> {
    match shape.last() {
        Some(&out) if out > 0 => {
            let numel: usize = shape.iter().product();
            Ok((numel / out, out))
        }
        _ => Err(Error::InvalidArgument {
            arg: "params",
            reason: format!("weights of shape {shape:?} have no output dimension"),
        }),
    }
}

/// View layer parameters as a `[fan_in, fan_out]` matrix, appending the bias
/// as a final row when present.
pub fn layer_params_to_mat2d<R, C>(client: &C, params: &LayerParams<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    match params.tensors() {
        [w] => {
            let (rows, out) = weight_rows(w.shape())?;
            Ok(w.contiguous()?.reshape(&[rows, out])?)
        }
        [w, b] => {
            let (rows, out) = weight_rows(w.shape())?;
            if b.numel() != out {
                return Err(Error::InvalidArgument {
                    arg: "params",
                    reason: format!(
                        "bias has {} elements, weights have {out} outputs",
                        b.numel()
                    ),
                });
            }
            let w2d = w.contiguous()?.reshape(&[rows, out])?;
            let b2d = b.contiguous()?.reshape(&[1, out])?;
            Ok(client.cat(&[&w2d, &b2d], 0)?)
        }
        other => Err(Error::InvalidArgument {
            arg: "params",
            reason: format!("expected weights or (weights, bias), got {} tensors", other.len()),
        }),
    }
}

/// Inverse of [`layer_params_to_mat2d`], shaped like `like`.
pub fn mat2d_to_layer_params<R>(like: &LayerParams<R>, mat2d: &Tensor<R>) -> Result<LayerParams<R>>
where
    R: Runtime<DType = DType>,
{
    match like.tensors() {
        [w] => Ok(LayerParams::weights(mat2d.contiguous()?.reshape(w.shape())?)),
        [w, b] => {
            let rows = mat2d.shape()[0];
            if rows == 0 {
                return Err(Error::InvalidArgument {
                    arg: "mat2d",
                    reason: "matrix has no rows".to_string(),
                });
            }
            let w_part = mat2d.narrow(0, 0, rows - 1)?.contiguous()?.reshape(w.shape())?;
            let b_part = mat2d.narrow(0, rows - 1, 1)?.contiguous()?.reshape(b.shape())?;
            Ok(LayerParams::with_bias(w_part, b_part))
        }
        other => Err(Error::InvalidArgument {
            arg: "like",
            reason: format!("expected weights or (weights, bias), got {} tensors", other.len()),
        }),
    }
}

/// Flatten and stack every tensor into one `[numel, 1]` column.
pub fn tensors_to_column<R, C>(client: &C, params: &LayerParams<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let columns = params
        .tensors()
        .iter()
        .map(|t| t.contiguous().and_then(|c| c.reshape(&[t.numel(), 1])))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match columns.as_slice() {
        [] => Err(Error::InvalidArgument {
            arg: "params",
            reason: "no tensors to flatten".to_string(),
        }),
        [single] => Ok(single.clone()),
        many => {
            let refs: Vec<&Tensor<R>> = many.iter().collect();
            Ok(client.cat(&refs, 0)?)
        }
    }
}

/// Split a column back into tensors shaped like `like`.
pub fn column_to_tensors<R>(like: &LayerParams<R>, column: &Tensor<R>) -> Result<LayerParams<R>>
where
    R: Runtime<DType = DType>,
{
    if column.numel() != like.numel() {
        return Err(Error::InvalidArgument {
            arg: "column",
            reason: format!(
                "column has {} elements, parameters have {}",
                column.numel(),
                like.numel()
            ),
        });
    }
    let flat = column.contiguous()?.reshape(&[column.numel()])?;
    let mut offset = 0;
    let mut tensors = Vec::with_capacity(like.len());
    for t in like.tensors() {
        let n = t.numel();
        tensors.push(flat.narrow(0, offset, n)?.contiguous()?.reshape(t.shape())?);
        offset += n;
    }
    Ok(LayerParams::from_tensors(tensors))
}
