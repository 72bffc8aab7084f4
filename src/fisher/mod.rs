//! Fisher blocks: per-layer curvature approximations

pub mod any;
pub mod block;
pub mod conv;
pub mod depthwise;
pub mod diagonal;
pub mod full;
pub mod kronecker;
pub mod multi_indep;
pub mod series;
pub mod towers;

pub use any::{AnyFisherBlock, BlockKind, GradsList, TowerData};
pub use block::FisherBlock;
pub use conv::num_conv_locations;
pub use depthwise::{
    conv2d_filter_to_depthwise_conv2d_filter, depthwise_conv2d_filter_to_conv2d_filter,
    DepthwiseConvDiagonalFB, DepthwiseConvKFCBasicFB,
};
pub use diagonal::{ConvDiagonalFB, FullyConnectedDiagonalFB};
pub use full::{FullFB, NaiveDiagonalFB};
pub use kronecker::{ConvKFCBasicFB, EmbeddingKFACFB, FullyConnectedKFACBasicFB, KroneckerProductFB};
pub use multi_indep::{
    ConvKFCBasicMultiIndepFB, EmbeddingKFACMultiIndepFB, FullyConnectedMultiIndepFB,
};
pub use series::{option2_denominator, series_gamma, FullyConnectedSeriesFB, SeriesApproximation};
pub use towers::{BatchSizeTowers, CanonicalData, InputOutputTowers, MultiUseTowers};
