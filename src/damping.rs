//! Damping arithmetic shared by all blocks
//!
//! Damping is added to a factor before it is inverted. For a Kronecker product
//! `A ⊗ G` the damping `λ` is split as `(λ·π, λ/π)` so that
//! `(A + λπ I) ⊗ (G + λ/π I)` stays close to `A ⊗ G + λ² I` in scale.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::config::{KfacConfig, PiType};
use crate::error::{Error, Result};
use crate::utils::host::to_host;

/// Scale damping down by `num_replications^power` (identity when the
/// configured power is zero).
pub fn normalize_damping(config: &KfacConfig, damping: f64, num_replications: f64) -> f64 {
    let power = config.normalize_damping_power;
    if power != 0.0 {
        damping / num_replications.powf(power)
    } else {
        damping
    }
}

/// Trace and dimension of a covariance given as a full matrix or as its diagonal.
fn trace_and_dim<R: Runtime<DType = DType>>(
    arg: &'static str,
    cov: &Tensor<R>,
) -> Result<(f64, usize)> {
    let data = to_host(cov)?;
    match cov.shape() {
        [n] => Ok((data.iter().sum(), *n)),
        [n, m] if n == m => Ok(((0..*n).map(|i| data[i * n + i]).sum(), *n)),
        shape => Err(Error::InvalidArgument {
            arg,
            reason: format!(
                "expected a diagonal (rank 1) or square matrix (rank 2), got shape {shape:?}"
            ),
        }),
    }
}

/// `π = sqrt((tr(A)·n) / (tr(B)·m))` for `A: m×m`, `B: n×n`: the ratio of the
/// factors' average eigenvalues.
pub fn compute_pi_tracenorm<R: Runtime<DType = DType>>(
    left_cov: &Tensor<R>,
    right_cov: &Tensor<R>,
) -> Result<f64> {
    let (left_trace, left_dim) = trace_and_dim("left_cov", left_cov)?;
    let (right_trace, right_dim) = trace_and_dim("right_cov", right_cov)?;
    Ok(((left_trace * right_dim as f64) / (right_trace * left_dim as f64)).sqrt())
}

/// Split `damping` between the left and right factors.
pub fn compute_pi_adjusted_damping<R: Runtime<DType = DType>>(
    pi_type: PiType,
    left_cov: &Tensor<R>,
    right_cov: &Tensor<R>,
    damping: f64,
) -> Result<(f64, f64)> {
    match pi_type {
        PiType::Tracenorm => {
            let pi = compute_pi_tracenorm(left_cov, right_cov)?;
            Ok((damping * pi, damping / pi))
        }
        PiType::Off => Ok((damping, damping)),
    }
}
