//! # kfacr
//!
//! **Kronecker-factored curvature approximations built on numr.**
//!
//! kfacr approximates diagonal blocks of a model's Fisher information (or
//! Gauss-Newton) matrix and multiplies vectors by damped powers of those
//! approximations, which is the core of the K-FAC second-order optimizer.
//! It uses numr's runtime, tensors, and ops directly.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  fisher    Fisher blocks (Full, Diagonal, KFAC, Series) │
//! │            tower/use normalization, depthwise adapters  │
//! ├─────────────────────────────────────────────────────────┤
//! │  factors   covariance factors, LayerCollection registry │
//! ├─────────────────────────────────────────────────────────┤
//! │  damping · thunk · config · utils                       │
//! └──────────────────────────┬──────────────────────────────┘
//! │                      numr                                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. Build a block for a layer and register one or more towers.
//! 2. `instantiate_factors` once, through a [`LayerCollection`](factors::LayerCollection).
//! 3. Register the matrix powers you need (`register_inverse`, `register_matpower`).
//! 4. Multiply gradients by the damped approximation or its inverse.

pub mod config;
pub mod damping;
pub mod error;
pub mod factors;
pub mod fisher;
pub mod thunk;
pub mod utils;

use numr::dtype::DType;
use numr::ops::{BinaryOps, MatmulOps, ReduceOps, ScalarOps, ShapeOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};

pub use config::{KfacConfig, PiType, TowerStrategy};
pub use error::{Error, Result};
pub use factors::LayerCollection;
pub use fisher::{AnyFisherBlock, BlockKind, FisherBlock};
pub use thunk::{Damping, DampingFunc, FuncId, FuncKey, PackagedFunc, SharedDamping};
pub use utils::{LayerParams, PartitionedTensor, Uses};

// Re-export numr types that users will commonly need
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::tensor::Tensor;

/// Client capabilities needed to build statistics and multiply by curvature blocks.
pub trait KfacClient<R: Runtime<DType = DType>>:
    RuntimeClient<R>
    + BinaryOps<R>
    + UnaryOps<R>
    + ScalarOps<R>
    + ReduceOps<R>
    + MatmulOps<R>
    + ShapeOps<R>
{
}

impl<R, C> KfacClient<R> for C
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ScalarOps<R>
        + ReduceOps<R>
        + MatmulOps<R>
        + ShapeOps<R>,
{
}

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
