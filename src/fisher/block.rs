//! The Fisher block contract

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::{Error, Result};
use crate::factors::LayerCollection;
use crate::thunk::Damping;
use crate::utils::LayerParams;
use crate::KfacClient;

/// A block of the Fisher information matrix for one layer's parameters.
///
/// Lifecycle: register towers (inherent per block type), then
/// [`instantiate_factors`](Self::instantiate_factors) exactly once, then
/// register the powers you need, then multiply as often as you like.
pub trait FisherBlock<R: Runtime<DType = DType>> {
    /// Shape of the per-source gradient list this block consumes.
    type Grads: ?Sized;

    /// Build (or fetch from `collection`) the factors this block uses.
    ///
    /// Fails with [`Error::State`] on a second call.
    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &Self::Grads,
        damping: &Damping,
    ) -> Result<()>;

    /// Declare that `multiply_matpower(_, exp)` will be called.
    fn register_matpower(&self, exp: f64) -> Result<()>;

    fn register_inverse(&self) -> Result<()> {
        self.register_matpower(-1.0)
    }

    /// Multiply `vector` (shaped like the layer's parameters) by the damped
    /// block raised to `exp`.
    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>>;

    fn multiply_inverse<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
    ) -> Result<LayerParams<R>> {
        self.multiply_matpower(client, vector, -1.0)
    }

    fn multiply<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
    ) -> Result<LayerParams<R>> {
        self.multiply_matpower(client, vector, 1.0)
    }

    /// Tensors whose gradients the caller must supply in `grads_list`.
    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>>;

    fn num_registered_towers(&self) -> usize;
}

pub(crate) fn already_instantiated(block: &str) -> Error {
    Error::State {
        reason: format!("{block}: factors were already instantiated"),
    }
}

pub(crate) fn not_instantiated(block: &str) -> Error {
    Error::State {
        reason: format!("{block}: instantiate_factors must be called first"),
    }
}

pub(crate) fn no_towers(block: &str) -> Error {
    Error::State {
        reason: format!("{block}: no towers registered"),
    }
}
