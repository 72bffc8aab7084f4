//! Second-moment estimators shared by the factor types

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::utils::host::{from_host, to_host};
use crate::utils::{ConvGeometry, PartitionedTensor};
use crate::KfacClient;

/// Collapse all leading dims: `[..., d]` → `[rows, d]`.
pub(crate) fn as_matrix<R: Runtime<DType = DType>>(t: &Tensor<R>) -> Result<Tensor<R>> {
    let shape = t.shape();
    let Some(&d) = shape.last() else {
        return Err(Error::InvalidArgument {
            arg: "tensor",
            reason: "scalar tensors carry no features".to_string(),
        });
    };
    let rows = if d == 0 { 0 } else { t.numel() / d };
    Ok(t.contiguous()?.reshape(&[rows, d])?)
}

/// `[rows, d]` → `[rows, d + 1]` with a trailing column of ones.
pub(crate) fn append_ones<R, C>(client: &C, x: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let rows = x.shape()[0];
    let ones = Tensor::<R>::ones(&[rows, 1], x.dtype(), x.device())?;
    Ok(client.cat(&[x, &ones], 1)?)
}

/// `[rows, d]` view of a merged batch, with an optional ones column.
pub(crate) fn design_matrix<R, C>(
    client: &C,
    data: &PartitionedTensor<R>,
    append_bias: bool,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let x = as_matrix(&data.materialize(client)?)?;
    if append_bias {
        append_ones(client, &x)
    } else {
        Ok(x)
    }
}

/// `xᵀ x / rows`.
pub(crate) fn second_moment<R, C>(client: &C, x: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let rows = x.shape()[0];
    if rows == 0 {
        return Err(Error::InvalidArgument {
            arg: "data",
            reason: "cannot estimate a covariance from zero rows".to_string(),
        });
    }
    let gram = client.matmul(&x.transpose(-2, -1)?, x)?;
    Ok(client.mul_scalar(&gram, 1.0 / rows as f64)?)
}

/// `Σ_sources mean_towers f(source, tower)`.
pub(crate) fn sum_sources_mean_towers<R, C, F>(
    client: &C,
    sources: &[Vec<PartitionedTensor<R>>],
    mut f: F,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
    F: FnMut(&PartitionedTensor<R>) -> Result<Tensor<R>>,
{
    let num_towers = sources.first().map_or(0, Vec::len);
    if num_towers == 0 || sources.iter().any(|s| s.len() != num_towers) {
        return Err(Error::InvalidArgument {
            arg: "sources",
            reason: "every source needs the same, nonzero, number of towers".to_string(),
        });
    }
    let mut total: Option<Tensor<R>> = None;
    for tower in sources.iter().flatten() {
        let contrib = f(tower)?;
        total = Some(match total {
            Some(acc) => client.add(&acc, &contrib)?,
            None => contrib,
        });
    }
    let total = total.ok_or_else(|| Error::InvalidArgument {
        arg: "sources",
        reason: "no data".to_string(),
    })?;
    if num_towers == 1 {
        Ok(total)
    } else {
        Ok(client.mul_scalar(&total, 1.0 / num_towers as f64)?)
    }
}

/// Mean over towers of `f(tower)`.
pub(crate) fn mean_towers<R, C, F>(
    client: &C,
    towers: &[PartitionedTensor<R>],
    f: F,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
    F: FnMut(&PartitionedTensor<R>) -> Result<Tensor<R>>,
{
    sum_sources_mean_towers(client, std::slice::from_ref(&towers.to_vec()), f)
}

/// Image patches of a merged conv input batch, as a `[rows, kh·kw·C(+1)]` tensor.
pub(crate) fn conv_patches<R, C>(
    client: &C,
    data: &PartitionedTensor<R>,
    geometry: &ConvGeometry,
    append_bias: bool,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let x = data.materialize(client)?;
    let host = to_host(&x)?;
    let (patches, rows, cols) = geometry.extract(&host, x.shape(), append_bias)?;
    from_host::<R>(&patches, &[rows, cols], x.device())
}

/// Lag-one cross moment of use-major folded rows:
/// `Σ_t X_{t+1}ᵀ X_t / (B·(T−1))` for `X: [T·B, d]`.
pub(crate) fn lag_one_moment<R, C>(client: &C, x: &Tensor<R>, num_uses: usize) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    if num_uses < 2 {
        return Err(Error::UseCount {
            reason: format!("lag-one statistics need at least two uses, got {num_uses}"),
        });
    }
    let &[rows, d] = x.shape() else {
        return Err(Error::InvalidArgument {
            arg: "x",
            reason: format!("expected a matrix, got shape {:?}", x.shape()),
        });
    };
    if rows % num_uses != 0 {
        return Err(Error::UseCount {
            reason: format!("{rows} rows cannot be split evenly into {num_uses} uses"),
        });
    }
    let per_use = rows / num_uses;
    let pairs = (num_uses - 1) * per_use;
    let next = x.narrow(0, per_use, pairs)?.contiguous()?.reshape(&[pairs, d])?;
    let prev = x.narrow(0, 0, pairs)?.contiguous()?.reshape(&[pairs, d])?;
    let cross = client.matmul(&next.transpose(-2, -1)?, &prev)?;
    Ok(client.mul_scalar(&cross, 1.0 / pairs as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use crate::utils::TrackedTensor;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_second_moment() {
        let (client, device) = cpu_setup();
        let x =
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap();
        let m = second_moment(&client, &x).unwrap();
        // (1·1 + 3·3)/2, (1·2 + 3·4)/2, (2·2 + 4·4)/2
        assert_eq!(m.to_vec::<f32>(), vec![5.0, 7.0, 7.0, 10.0]);
    }

    #[test]
    fn test_design_matrix_with_bias() {
        let (client, device) = cpu_setup();
        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2, 1], &device).unwrap();
        let pt = PartitionedTensor::single(TrackedTensor::new(&x));
        let d = design_matrix(&client, &pt, true).unwrap();
        assert_eq!(d.shape(), &[2, 2]);
        assert_eq!(d.to_vec::<f32>(), vec![1.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_lag_one_moment() {
        let (client, device) = cpu_setup();
        // T = 3 uses, B = 1 row each, d = 1: x = [1, 2, 3]
        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[3, 1], &device).unwrap();
        let m = lag_one_moment(&client, &x, 3).unwrap();
        // (2·1 + 3·2) / 2
        assert!((m.to_vec::<f32>()[0] - 4.0).abs() < 1e-6);
        assert!(lag_one_moment(&client, &x, 1).is_err());
    }

    #[test]
    fn test_tower_mean() {
        let (client, device) = cpu_setup();
        let a = Tensor::<CpuRuntime>::from_slice(&[2.0f32], &[1, 1], &device).unwrap();
        let b = Tensor::<CpuRuntime>::from_slice(&[4.0f32], &[1, 1], &device).unwrap();
        let towers = vec![
            PartitionedTensor::single(TrackedTensor::new(&a)),
            PartitionedTensor::single(TrackedTensor::new(&b)),
        ];
        let m = mean_towers(
            &client,
            &towers,
            |t| second_moment(&client, &as_matrix(&t.materialize(&client)?)?),
        )
        .unwrap();
        assert!((m.to_vec::<f32>()[0] - 10.0).abs() < 1e-6);
    }
}
