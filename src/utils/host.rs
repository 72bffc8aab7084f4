//! Host transfers for statistics computed outside the tensor runtime

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};

/// Copy an F32 tensor to the host as f64, in row-major order.
pub(crate) fn to_host<R: Runtime<DType = DType>>(t: &Tensor<R>) -> Result<Vec<f64>> {
    if t.dtype() != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: t.dtype(),
        });
    }
    let data: Vec<f32> = t.contiguous()?.try_to_vec()?;
    Ok(data.into_iter().map(f64::from).collect())
}

/// Build an F32 tensor from host f64 data.
pub(crate) fn from_host<R: Runtime<DType = DType>>(
    data: &[f64],
    shape: &[usize],
    device: &R::Device,
) -> Result<Tensor<R>> {
    let data: Vec<f32> = data.iter().map(|&v| v as f32).collect();
    Ok(Tensor::<R>::from_slice(&data, shape, device)?)
}

/// Expand a diagonal, stored in any shape, into a dense square matrix.
pub(crate) fn diag_to_dense<R: Runtime<DType = DType>>(diag: &Tensor<R>) -> Result<Tensor<R>> {
    let values = to_host(diag)?;
    let n = values.len();
    let mut dense = vec![0.0; n * n];
    for (i, v) in values.iter().enumerate() {
        dense[i * n + i] = *v;
    }
    from_host::<R>(&dense, &[n, n], diag.device())
}

fn float_id(v: f32) -> Result<i64> {
    // `i64::MAX as f32` rounds up to 2^63, which is itself out of range.
    if !v.is_finite() || v.fract() != 0.0 || v.abs() >= i64::MAX as f32 {
        return Err(Error::InvalidArgument {
            arg: "ids",
            reason: format!("float id {v} is not an integer"),
        });
    }
    Ok(v as i64)
}

/// Read integer ids (I64, I32, or integral F32) from a tensor.
pub(crate) fn ids_to_host<R: Runtime<DType = DType>>(t: &Tensor<R>) -> Result<Vec<i64>> {
    let t = t.contiguous()?;
    match t.dtype() {
        DType::I64 => Ok(t.try_to_vec::<i64>()?),
        DType::I32 => Ok(t.try_to_vec::<i32>()?.into_iter().map(i64::from).collect()),
        DType::F32 => t
            .try_to_vec::<f32>()?
            .into_iter()
            .map(float_id)
            .collect(),
        other => Err(Error::DTypeMismatch {
            expected: DType::I64,
            got: other,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_float_ids_must_be_integral() {
        let (_client, device) = cpu_setup();
        let ok = Tensor::<CpuRuntime>::from_slice(&[0.0f32, 3.0, 7.0], &[3], &device).unwrap();
        assert_eq!(ids_to_host(&ok).unwrap(), vec![0, 3, 7]);

        for bad in [f32::NAN, f32::INFINITY, 2.5, -0.5, 1e19] {
            let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, bad], &[2], &device).unwrap();
            let err = ids_to_host(&t).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { arg: "ids", .. }), "{bad}");
        }
    }

    #[test]
    fn test_integer_ids_pass_through() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[4i32, 0, 9], &[3], &device).unwrap();
        assert_eq!(ids_to_host(&t).unwrap(), vec![4, 0, 9]);
    }
}
