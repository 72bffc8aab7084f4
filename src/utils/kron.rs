//! Kronecker product of two matrices

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::KfacClient;

/// `kron(a, b)` for `a: [m, n]`, `b: [p, q]`, giving `[m·p, n·q]`.
///
/// Computed as a broadcast product `a[:, None, :, None] * b[None, :, None, :]`
/// followed by a reshape.
pub fn kronecker_product<R, C>(client: &C, a: &Tensor<R>, b: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let (&[m, n], &[p, q]) = (a.shape(), b.shape()) else {
        return Err(Error::InvalidArgument {
            arg: "a, b",
            reason: format!(
                "kronecker product needs two matrices, got shapes {:?} and {:?}",
                a.shape(),
                b.shape()
            ),
        });
    };
    let a4 = a.contiguous()?.reshape(&[m, 1, n, 1])?;
    let b4 = b.contiguous()?.reshape(&[1, p, 1, q])?;
    let prod = client.mul(&a4, &b4)?;
    Ok(prod.contiguous()?.reshape(&[m * p, n * q])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_kron_2x2_identity() {
        let (client, device) = cpu_setup();
        let a =
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap();
        let eye =
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2], &device).unwrap();
        let k = kronecker_product(&client, &a, &eye).unwrap();
        assert_eq!(k.shape(), &[4, 4]);
        #[rustfmt::skip]
        let expected = vec![
            1.0, 0.0, 2.0, 0.0,
            0.0, 1.0, 0.0, 2.0,
            3.0, 0.0, 4.0, 0.0,
            0.0, 3.0, 0.0, 4.0,
        ];
        assert_eq!(k.to_vec::<f32>(), expected);
    }

    #[test]
    fn test_rejects_vectors() {
        let (client, device) = cpu_setup();
        let a = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device).unwrap();
        assert!(kronecker_product(&client, &a, &a).is_err());
    }
}
