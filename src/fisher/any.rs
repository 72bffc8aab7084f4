//! Closed sum over every Fisher block type
//!
//! Provides `AnyFisherBlock<R>` so heterogeneous layers can be kept in one
//! collection and driven through a single lifecycle API. `GradsList` and
//! `TowerData` carry the argument shapes that differ between block families.

use std::fmt;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::block::FisherBlock;
use super::depthwise::{DepthwiseConvDiagonalFB, DepthwiseConvKFCBasicFB};
use super::diagonal::{ConvDiagonalFB, FullyConnectedDiagonalFB};
use super::full::{FullFB, NaiveDiagonalFB};
use super::kronecker::{ConvKFCBasicFB, EmbeddingKFACFB, FullyConnectedKFACBasicFB};
use super::multi_indep::{
    ConvKFCBasicMultiIndepFB, EmbeddingKFACMultiIndepFB, FullyConnectedMultiIndepFB,
};
use super::series::FullyConnectedSeriesFB;
use crate::error::{Error, Result};
use crate::factors::LayerCollection;
use crate::thunk::Damping;
use crate::utils::{LayerParams, Uses};
use crate::KfacClient;

/// Serializable tag naming a block type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Full,
    NaiveDiagonal,
    FullyConnectedDiagonal,
    ConvDiagonal,
    DepthwiseConvDiagonal,
    FullyConnectedKfacBasic,
    ConvKfcBasic,
    DepthwiseConvKfcBasic,
    EmbeddingKfac,
    FullyConnectedMultiIndep,
    ConvKfcBasicMultiIndep,
    EmbeddingKfacMultiIndep,
    FullyConnectedSeries,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::NaiveDiagonal => "naive_diagonal",
            Self::FullyConnectedDiagonal => "fully_connected_diagonal",
            Self::ConvDiagonal => "conv_diagonal",
            Self::DepthwiseConvDiagonal => "depthwise_conv_diagonal",
            Self::FullyConnectedKfacBasic => "fully_connected_kfac_basic",
            Self::ConvKfcBasic => "conv_kfc_basic",
            Self::DepthwiseConvKfcBasic => "depthwise_conv_kfc_basic",
            Self::EmbeddingKfac => "embedding_kfac",
            Self::FullyConnectedMultiIndep => "fully_connected_multi_indep",
            Self::ConvKfcBasicMultiIndep => "conv_kfc_basic_multi_indep",
            Self::EmbeddingKfacMultiIndep => "embedding_kfac_multi_indep",
            Self::FullyConnectedSeries => "fully_connected_series",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source gradients in the shape a block family expects.
pub enum GradsList<R: Runtime> {
    /// Gradients with respect to the parameters: `[source]`.
    Params(Vec<LayerParams<R>>),
    /// Gradients with respect to layer outputs: `[source][tower]`.
    Towers(Vec<Vec<Tensor<R>>>),
    /// Gradients with respect to multi-use outputs: `[source][tower]`.
    Uses(Vec<Vec<Uses<Tensor<R>>>>),
}

impl<R: Runtime> GradsList<R> {
    fn shape_name(&self) -> &'static str {
        match self {
            Self::Params(_) => "Params",
            Self::Towers(_) => "Towers",
            Self::Uses(_) => "Uses",
        }
    }
}

/// One tower's registration data.
pub enum TowerData<R: Runtime> {
    BatchSize(usize),
    InputOutput {
        inputs: Tensor<R>,
        outputs: Tensor<R>,
    },
    MultiUse {
        inputs: Uses<Tensor<R>>,
        outputs: Uses<Tensor<R>>,
    },
}

impl<R: Runtime> TowerData<R> {
    fn shape_name(&self) -> &'static str {
        match self {
            Self::BatchSize(_) => "BatchSize",
            Self::InputOutput { .. } => "InputOutput",
            Self::MultiUse { .. } => "MultiUse",
        }
    }
}

/// Enum of all supported Fisher blocks
pub enum AnyFisherBlock<R: Runtime> {
    Full(Box<FullFB<R>>),
    NaiveDiagonal(Box<NaiveDiagonalFB<R>>),
    FullyConnectedDiagonal(Box<FullyConnectedDiagonalFB<R>>),
    ConvDiagonal(Box<ConvDiagonalFB<R>>),
    DepthwiseConvDiagonal(Box<DepthwiseConvDiagonalFB<R>>),
    FullyConnectedKfacBasic(Box<FullyConnectedKFACBasicFB<R>>),
    ConvKfcBasic(Box<ConvKFCBasicFB<R>>),
    DepthwiseConvKfcBasic(Box<DepthwiseConvKFCBasicFB<R>>),
    EmbeddingKfac(Box<EmbeddingKFACFB<R>>),
    FullyConnectedMultiIndep(Box<FullyConnectedMultiIndepFB<R>>),
    ConvKfcBasicMultiIndep(Box<ConvKFCBasicMultiIndepFB<R>>),
    EmbeddingKfacMultiIndep(Box<EmbeddingKFACMultiIndepFB<R>>),
    FullyConnectedSeries(Box<FullyConnectedSeriesFB<R>>),
}

/// Run `$body` with `$b` bound to the inner block, whatever the variant.
macro_rules! each_block {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            AnyFisherBlock::Full($b) => $body,
            AnyFisherBlock::NaiveDiagonal($b) => $body,
            AnyFisherBlock::FullyConnectedDiagonal($b) => $body,
            AnyFisherBlock::ConvDiagonal($b) => $body,
            AnyFisherBlock::DepthwiseConvDiagonal($b) => $body,
            AnyFisherBlock::FullyConnectedKfacBasic($b) => $body,
            AnyFisherBlock::ConvKfcBasic($b) => $body,
            AnyFisherBlock::DepthwiseConvKfcBasic($b) => $body,
            AnyFisherBlock::EmbeddingKfac($b) => $body,
            AnyFisherBlock::FullyConnectedMultiIndep($b) => $body,
            AnyFisherBlock::ConvKfcBasicMultiIndep($b) => $body,
            AnyFisherBlock::EmbeddingKfacMultiIndep($b) => $body,
            AnyFisherBlock::FullyConnectedSeries($b) => $body,
        }
    };
}

fn shape_mismatch(arg: &'static str, kind: BlockKind, expected: &str, got: &str) -> Error {
    Error::InvalidArgument {
        arg,
        reason: format!("{kind} expects {expected}, got {got}"),
    }
}

impl<R: Runtime<DType = DType>> AnyFisherBlock<R> {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::Full(_) => BlockKind::Full,
            Self::NaiveDiagonal(_) => BlockKind::NaiveDiagonal,
            Self::FullyConnectedDiagonal(_) => BlockKind::FullyConnectedDiagonal,
            Self::ConvDiagonal(_) => BlockKind::ConvDiagonal,
            Self::DepthwiseConvDiagonal(_) => BlockKind::DepthwiseConvDiagonal,
            Self::FullyConnectedKfacBasic(_) => BlockKind::FullyConnectedKfacBasic,
            Self::ConvKfcBasic(_) => BlockKind::ConvKfcBasic,
            Self::DepthwiseConvKfcBasic(_) => BlockKind::DepthwiseConvKfcBasic,
            Self::EmbeddingKfac(_) => BlockKind::EmbeddingKfac,
            Self::FullyConnectedMultiIndep(_) => BlockKind::FullyConnectedMultiIndep,
            Self::ConvKfcBasicMultiIndep(_) => BlockKind::ConvKfcBasicMultiIndep,
            Self::EmbeddingKfacMultiIndep(_) => BlockKind::EmbeddingKfacMultiIndep,
            Self::FullyConnectedSeries(_) => BlockKind::FullyConnectedSeries,
        }
    }

    fn expected_shape(&self) -> (&'static str, &'static str) {
        match self {
            Self::Full(_) | Self::NaiveDiagonal(_) => ("BatchSize", "Params"),
            Self::FullyConnectedMultiIndep(_)
            | Self::ConvKfcBasicMultiIndep(_)
            | Self::EmbeddingKfacMultiIndep(_)
            | Self::FullyConnectedSeries(_) => ("MultiUse", "Uses"),
            _ => ("InputOutput", "Towers"),
        }
    }

    /// Register one tower; the data shape must match the block family.
    pub fn register_additional_tower(&mut self, tower: TowerData<R>) -> Result<()> {
        let kind = self.kind();
        let (expected, _) = self.expected_shape();
        match (self, tower) {
            (Self::Full(b), TowerData::BatchSize(n)) => b.register_additional_tower(n),
            (Self::NaiveDiagonal(b), TowerData::BatchSize(n)) => b.register_additional_tower(n),
            (Self::FullyConnectedDiagonal(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::ConvDiagonal(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::DepthwiseConvDiagonal(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::FullyConnectedKfacBasic(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::ConvKfcBasic(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::DepthwiseConvKfcBasic(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::EmbeddingKfac(b), TowerData::InputOutput { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::FullyConnectedMultiIndep(b), TowerData::MultiUse { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::ConvKfcBasicMultiIndep(b), TowerData::MultiUse { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::EmbeddingKfacMultiIndep(b), TowerData::MultiUse { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (Self::FullyConnectedSeries(b), TowerData::MultiUse { inputs, outputs }) => {
                b.register_additional_tower(&inputs, &outputs)
            }
            (_, other) => return Err(shape_mismatch("tower", kind, expected, other.shape_name())),
        }
        Ok(())
    }

    pub fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &GradsList<R>,
        damping: &Damping,
    ) -> Result<()> {
        let kind = self.kind();
        let (_, expected) = self.expected_shape();
        match (self, grads_list) {
            (Self::Full(b), GradsList::Params(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::NaiveDiagonal(b), GradsList::Params(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::FullyConnectedDiagonal(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::ConvDiagonal(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::DepthwiseConvDiagonal(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::FullyConnectedKfacBasic(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::ConvKfcBasic(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::DepthwiseConvKfcBasic(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::EmbeddingKfac(b), GradsList::Towers(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::FullyConnectedMultiIndep(b), GradsList::Uses(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::ConvKfcBasicMultiIndep(b), GradsList::Uses(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::EmbeddingKfacMultiIndep(b), GradsList::Uses(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (Self::FullyConnectedSeries(b), GradsList::Uses(g)) => {
                b.instantiate_factors(client, collection, g, damping)
            }
            (_, other) => Err(shape_mismatch(
                "grads_list",
                kind,
                expected,
                other.shape_name(),
            )),
        }
    }

    pub fn register_matpower(&self, exp: f64) -> Result<()> {
        each_block!(self, b => b.register_matpower(exp))
    }

    pub fn register_inverse(&self) -> Result<()> {
        self.register_matpower(-1.0)
    }

    pub fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        each_block!(self, b => b.multiply_matpower(client, vector, exp))
    }

    pub fn multiply_inverse<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
    ) -> Result<LayerParams<R>> {
        self.multiply_matpower(client, vector, -1.0)
    }

    pub fn multiply<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
    ) -> Result<LayerParams<R>> {
        self.multiply_matpower(client, vector, 1.0)
    }

    pub fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        each_block!(self, b => b.tensors_to_compute_grads())
    }

    pub fn num_registered_towers(&self) -> usize {
        each_block!(self, b => b.num_registered_towers())
    }

    /// Dense form of the block, for the variants that can build one.
    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        match self {
            Self::Full(b) => b.full_fisher_block(),
            Self::NaiveDiagonal(b) => b.full_fisher_block(),
            Self::FullyConnectedKfacBasic(b) => b.full_fisher_block(client),
            Self::ConvKfcBasic(b) => b.full_fisher_block(client),
            Self::DepthwiseConvKfcBasic(b) => b.full_fisher_block(client),
            Self::EmbeddingKfac(b) => b.full_fisher_block(client),
            Self::FullyConnectedMultiIndep(b) => b.full_fisher_block(client),
            Self::ConvKfcBasicMultiIndep(b) => b.full_fisher_block(client),
            Self::EmbeddingKfacMultiIndep(b) => b.full_fisher_block(client),
            other => Err(Error::Unsupported {
                feature: format!("full_fisher_block for {}", other.kind()),
            }),
        }
    }
}

macro_rules! impl_from_block {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl<R: Runtime> From<$ty<R>> for AnyFisherBlock<R> {
                fn from(block: $ty<R>) -> Self {
                    AnyFisherBlock::$variant(Box::new(block))
                }
            }
        )*
    };
}

impl_from_block! {
    FullFB => Full,
    NaiveDiagonalFB => NaiveDiagonal,
    FullyConnectedDiagonalFB => FullyConnectedDiagonal,
    ConvDiagonalFB => ConvDiagonal,
    DepthwiseConvDiagonalFB => DepthwiseConvDiagonal,
    FullyConnectedKFACBasicFB => FullyConnectedKfacBasic,
    ConvKFCBasicFB => ConvKfcBasic,
    DepthwiseConvKFCBasicFB => DepthwiseConvKfcBasic,
    EmbeddingKFACFB => EmbeddingKfac,
    FullyConnectedMultiIndepFB => FullyConnectedMultiIndep,
    ConvKFCBasicMultiIndepFB => ConvKfcBasicMultiIndep,
    EmbeddingKFACMultiIndepFB => EmbeddingKfacMultiIndep,
    FullyConnectedSeriesFB => FullyConnectedSeries,
}
