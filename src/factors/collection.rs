//! Registry of factors shared between blocks
//!
//! Blocks never build factors directly. They describe the factor they need as
//! a [`FactorSpec`]; the collection derives a structural [`FactorKey`] from it
//! (factor kind, identities of the contributing tensors, shape parameters)
//! and returns the existing factor when one with the same key was already
//! built.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use tracing::debug;

use super::diagonal::DiagonalFactor;
use super::full::FullFactor;
use super::kronecker::KroneckerFactor;
use crate::config::KfacConfig;
use crate::error::{Error, Result};
use crate::thunk::IdAtom;
use crate::utils::{ConvGeometry, PartKey, PartitionedTensor, TrackedTensor};
use crate::KfacClient;

/// Tag distinguishing factor constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorKind {
    Full,
    NaiveDiagonal,
    FullyConnectedDiagonal,
    ConvDiagonal,
    FullyConnectedKronecker,
    FullyConnectedMultiKronecker,
    ConvInputKronecker,
    ConvOutputKronecker,
    EmbeddingInputKronecker,
}

impl FactorKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Full => "ff",
            Self::NaiveDiagonal => "ndf",
            Self::FullyConnectedDiagonal => "fcdf",
            Self::ConvDiagonal => "cdf",
            Self::FullyConnectedKronecker => "fckf",
            Self::FullyConnectedMultiKronecker => "fcmkf",
            Self::ConvInputKronecker => "cikf",
            Self::ConvOutputKronecker => "cokf",
            Self::EmbeddingInputKronecker => "eikf",
        }
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Construction arguments for a factor.
///
/// Tensor lists are `[tower]` for inputs and `[source][tower]` for gradients;
/// `Full` and `NaiveDiagonal` take `[source][parameter]`.
pub enum FactorSpec<R: Runtime> {
    Full {
        grads: Vec<Vec<TrackedTensor<R>>>,
        batch_size: usize,
    },
    NaiveDiagonal {
        grads: Vec<Vec<TrackedTensor<R>>>,
        batch_size: usize,
    },
    FullyConnectedDiagonal {
        inputs: Vec<PartitionedTensor<R>>,
        grads: Vec<Vec<PartitionedTensor<R>>>,
        has_bias: bool,
    },
    ConvDiagonal {
        inputs: Vec<PartitionedTensor<R>>,
        grads: Vec<Vec<PartitionedTensor<R>>>,
        geometry: ConvGeometry,
        has_bias: bool,
    },
    FullyConnectedKronecker {
        tensors: Vec<Vec<PartitionedTensor<R>>>,
        has_bias: bool,
    },
    FullyConnectedMultiKronecker {
        tensors: Vec<Vec<PartitionedTensor<R>>>,
        num_uses: usize,
        has_bias: bool,
    },
    ConvInputKronecker {
        inputs: Vec<PartitionedTensor<R>>,
        geometry: ConvGeometry,
        has_bias: bool,
    },
    ConvOutputKronecker {
        grads: Vec<Vec<PartitionedTensor<R>>>,
    },
    EmbeddingInputKronecker {
        inputs: Vec<PartitionedTensor<R>>,
        vocab_size: usize,
    },
}

/// Structural identity of a factor.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FactorKey {
    kind: FactorKind,
    tensors: Vec<Vec<Vec<PartKey>>>,
    params: Vec<IdAtom>,
}

impl FactorKey {
    pub fn kind(&self) -> FactorKind {
        self.kind
    }
}

fn tower_keys<R: Runtime<DType = DType>>(towers: &[PartitionedTensor<R>]) -> Vec<Vec<PartKey>> {
    towers.iter().map(PartitionedTensor::keys).collect()
}

fn param_keys<R: Runtime<DType = DType>>(params: &[TrackedTensor<R>]) -> Vec<Vec<PartKey>> {
    params.iter().map(|t| vec![t.key()]).collect()
}

fn bool_atom(flag: bool) -> IdAtom {
    IdAtom::Int(i64::from(flag))
}

fn geometry_atoms(geometry: &ConvGeometry) -> Vec<IdAtom> {
    let mut atoms: Vec<IdAtom> = geometry
        .kernel
        .iter()
        .chain(geometry.strides.iter())
        .chain(geometry.dilations.iter())
        .map(|&v| IdAtom::Int(v as i64))
        .collect();
    atoms.push(IdAtom::Str(geometry.padding.to_string()));
    atoms
}

impl<R: Runtime<DType = DType>> FactorSpec<R> {
    pub fn kind(&self) -> FactorKind {
        match self {
            Self::Full { .. } => FactorKind::Full,
            Self::NaiveDiagonal { .. } => FactorKind::NaiveDiagonal,
            Self::FullyConnectedDiagonal { .. } => FactorKind::FullyConnectedDiagonal,
            Self::ConvDiagonal { .. } => FactorKind::ConvDiagonal,
            Self::FullyConnectedKronecker { .. } => FactorKind::FullyConnectedKronecker,
            Self::FullyConnectedMultiKronecker { .. } => FactorKind::FullyConnectedMultiKronecker,
            Self::ConvInputKronecker { .. } => FactorKind::ConvInputKronecker,
            Self::ConvOutputKronecker { .. } => FactorKind::ConvOutputKronecker,
            Self::EmbeddingInputKronecker { .. } => FactorKind::EmbeddingInputKronecker,
        }
    }

    pub fn key(&self) -> FactorKey {
        let (tensors, params) = match self {
            Self::Full { grads, batch_size } | Self::NaiveDiagonal { grads, batch_size } => (
                grads.iter().map(|s| param_keys(s)).collect(),
                vec![IdAtom::Int(*batch_size as i64)],
            ),
            Self::FullyConnectedDiagonal {
                inputs,
                grads,
                has_bias,
            } => (
                std::iter::once(tower_keys(inputs))
                    .chain(grads.iter().map(|s| tower_keys(s)))
                    .collect(),
                vec![bool_atom(*has_bias)],
            ),
            Self::ConvDiagonal {
                inputs,
                grads,
                geometry,
                has_bias,
            } => {
                let mut params = geometry_atoms(geometry);
                params.push(bool_atom(*has_bias));
                (
                    std::iter::once(tower_keys(inputs))
                        .chain(grads.iter().map(|s| tower_keys(s)))
                        .collect(),
                    params,
                )
            }
            Self::FullyConnectedKronecker { tensors, has_bias } => (
                tensors.iter().map(|s| tower_keys(s)).collect(),
                vec![bool_atom(*has_bias)],
            ),
            Self::FullyConnectedMultiKronecker {
                tensors,
                num_uses,
                has_bias,
            } => (
                tensors.iter().map(|s| tower_keys(s)).collect(),
                vec![IdAtom::Int(*num_uses as i64), bool_atom(*has_bias)],
            ),
            Self::ConvInputKronecker {
                inputs,
                geometry,
                has_bias,
            } => {
                let mut params = geometry_atoms(geometry);
                params.push(bool_atom(*has_bias));
                (vec![tower_keys(inputs)], params)
            }
            Self::ConvOutputKronecker { grads } => {
                (grads.iter().map(|s| tower_keys(s)).collect(), Vec::new())
            }
            Self::EmbeddingInputKronecker { inputs, vocab_size } => (
                vec![tower_keys(inputs)],
                vec![IdAtom::Int(*vocab_size as i64)],
            ),
        };
        FactorKey {
            kind: self.kind(),
            tensors,
            params,
        }
    }

    fn build<C: KfacClient<R>>(&self, client: &C, name: String) -> Result<FactorRef<R>> {
        Ok(match self {
            Self::Full { grads, batch_size } => {
                FactorRef::Full(Arc::new(FullFactor::from_grads(client, name, grads, *batch_size)?))
            }
            Self::NaiveDiagonal { grads, batch_size } => FactorRef::Diagonal(Arc::new(
                DiagonalFactor::naive(client, name, grads, *batch_size)?,
            )),
            Self::FullyConnectedDiagonal {
                inputs,
                grads,
                has_bias,
            } => FactorRef::Diagonal(Arc::new(DiagonalFactor::fully_connected(
                client, name, inputs, grads, *has_bias,
            )?)),
            Self::ConvDiagonal {
                inputs,
                grads,
                geometry,
                has_bias,
            } => FactorRef::Diagonal(Arc::new(DiagonalFactor::conv(
                client, name, inputs, grads, geometry, *has_bias,
            )?)),
            Self::FullyConnectedKronecker { tensors, has_bias } => FactorRef::Kronecker(Arc::new(
                KroneckerFactor::fully_connected(client, name, tensors, *has_bias)?,
            )),
            Self::FullyConnectedMultiKronecker {
                tensors,
                num_uses,
                has_bias,
            } => FactorRef::Kronecker(Arc::new(KroneckerFactor::fully_connected_multi(
                client, name, tensors, *num_uses, *has_bias,
            )?)),
            Self::ConvInputKronecker {
                inputs,
                geometry,
                has_bias,
            } => FactorRef::Kronecker(Arc::new(KroneckerFactor::conv_input(
                client, name, inputs, geometry, *has_bias,
            )?)),
            Self::ConvOutputKronecker { grads } => FactorRef::Kronecker(Arc::new(
                KroneckerFactor::conv_output(client, name, grads)?,
            )),
            Self::EmbeddingInputKronecker { inputs, vocab_size } => FactorRef::Kronecker(
                Arc::new(KroneckerFactor::embedding_input(client, name, inputs, *vocab_size)?),
            ),
        })
    }
}

/// Shared handle to a factor of any family.
pub enum FactorRef<R: Runtime> {
    Full(Arc<FullFactor<R>>),
    Diagonal(Arc<DiagonalFactor<R>>),
    Kronecker(Arc<KroneckerFactor<R>>),
}

impl<R: Runtime> Clone for FactorRef<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Full(f) => Self::Full(Arc::clone(f)),
            Self::Diagonal(f) => Self::Diagonal(Arc::clone(f)),
            Self::Kronecker(f) => Self::Kronecker(Arc::clone(f)),
        }
    }
}

fn wrong_family(expected: &str) -> Error {
    Error::State {
        reason: format!("factor registered under this key is not a {expected} factor"),
    }
}

impl<R: Runtime> FactorRef<R> {
    pub fn into_full(self) -> Result<Arc<FullFactor<R>>> {
        match self {
            Self::Full(f) => Ok(f),
            _ => Err(wrong_family("full")),
        }
    }

    pub fn into_diagonal(self) -> Result<Arc<DiagonalFactor<R>>> {
        match self {
            Self::Diagonal(f) => Ok(f),
            _ => Err(wrong_family("diagonal")),
        }
    }

    pub fn into_kronecker(self) -> Result<Arc<KroneckerFactor<R>>> {
        match self {
            Self::Kronecker(f) => Ok(f),
            _ => Err(wrong_family("kronecker")),
        }
    }
}

/// Owns the configuration and deduplicates factors across blocks.
pub struct LayerCollection<R: Runtime> {
    config: KfacConfig,
    factors: HashMap<FactorKey, FactorRef<R>>,
    next_id: usize,
}

impl<R: Runtime<DType = DType>> LayerCollection<R> {
    /// Create a collection; the config is validated and then fixed.
    pub fn new(config: KfacConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factors: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn config(&self) -> &KfacConfig {
        &self.config
    }

    /// Number of distinct factors built so far.
    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    /// Return the factor for `spec`, building it on first request.
    pub fn make_or_get_factor<C: KfacClient<R>>(
        &mut self,
        client: &C,
        spec: FactorSpec<R>,
    ) -> Result<FactorRef<R>> {
        let key = spec.key();
        if let Some(existing) = self.factors.get(&key) {
            debug!(kind = %key.kind(), "reusing factor");
            return Ok(existing.clone());
        }
        let name = format!("{}_{}", key.kind(), self.next_id);
        let factor = spec.build(client, name.clone())?;
        self.next_id += 1;
        debug!(factor = %name, "created factor");
        self.factors.insert(key, factor.clone());
        Ok(factor)
    }

    pub fn make_or_get_kronecker<C: KfacClient<R>>(
        &mut self,
        client: &C,
        spec: FactorSpec<R>,
    ) -> Result<Arc<KroneckerFactor<R>>> {
        self.make_or_get_factor(client, spec)?.into_kronecker()
    }

    pub fn make_or_get_diagonal<C: KfacClient<R>>(
        &mut self,
        client: &C,
        spec: FactorSpec<R>,
    ) -> Result<Arc<DiagonalFactor<R>>> {
        self.make_or_get_factor(client, spec)?.into_diagonal()
    }

    pub fn make_or_get_full<C: KfacClient<R>>(
        &mut self,
        client: &C,
        spec: FactorSpec<R>,
    ) -> Result<Arc<FullFactor<R>>> {
        self.make_or_get_factor(client, spec)?.into_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::CovarianceFactor;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    fn pt(t: &Tensor<CpuRuntime>) -> PartitionedTensor<CpuRuntime> {
        PartitionedTensor::single(TrackedTensor::new(t))
    }

    #[test]
    fn test_same_tensors_share_factor() {
        let (client, device) = cpu_setup();
        let x =
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap();
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();

        let a = collection
            .make_or_get_kronecker(
                &client,
                FactorSpec::FullyConnectedKronecker {
                    tensors: vec![vec![pt(&x)]],
                    has_bias: true,
                },
            )
            .unwrap();
        let b = collection
            .make_or_get_kronecker(
                &client,
                FactorSpec::FullyConnectedKronecker {
                    tensors: vec![vec![pt(&x)]],
                    has_bias: true,
                },
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(collection.num_factors(), 1);

        let c = collection
            .make_or_get_kronecker(
                &client,
                FactorSpec::FullyConnectedKronecker {
                    tensors: vec![vec![pt(&x)]],
                    has_bias: false,
                },
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.name(), c.name());
        assert_eq!(collection.num_factors(), 2);
    }

    #[test]
    fn test_wrong_family_is_error() {
        let (client, device) = cpu_setup();
        let g = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device).unwrap();
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        let err = collection
            .make_or_get_kronecker(
                &client,
                FactorSpec::Full {
                    grads: vec![vec![TrackedTensor::new(&g)]],
                    batch_size: 1,
                },
            )
            .err()
            .unwrap();
        assert!(matches!(err, Error::State { .. }));
    }
}
