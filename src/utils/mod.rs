//! Tensor plumbing shared by factors and blocks

pub(crate) mod host;
pub mod kron;
pub(crate) mod linalg;
pub mod params;
pub mod partitioned;
pub mod patches;

pub use kron::kronecker_product;
pub use params::{
    column_to_tensors, layer_params_to_mat2d, mat2d_to_layer_params, tensors_to_column,
    LayerParams,
};
pub use partitioned::{PartKey, PartitionedTensor, TrackedTensor, Uses};
pub use patches::{ConvGeometry, DataFormat, Padding, PatchExtractor};
