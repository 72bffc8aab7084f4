//! Tower and use bookkeeping
//!
//! A block may be registered several times for the same layer: once per
//! tower (a data-parallel replica) and, for recurrent or shared layers, with
//! several uses per tower. Before factors are built, the registered data is
//! put into canonical form:
//!
//! ```text
//! concat:    inputs = [ one partitioned batch of every tower (use-major) ]
//!            grads  = per source: [ one partitioned batch ]
//! separate:  inputs = [ one batch per tower ]
//!            grads  = per source: [ one batch per tower ]
//! ```
//!
//! Use-major means all towers' rows for use 0, then all rows for use 1, and
//! so on, which is the order the lag-one statistics assume.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::config::TowerStrategy;
use crate::error::{Error, Result};
use crate::utils::{PartitionedTensor, TrackedTensor, Uses};

/// Canonicalized tower data: `inputs[tower]`, `grads[source][tower]`.
pub struct CanonicalData<R: Runtime> {
    pub inputs: Vec<PartitionedTensor<R>>,
    pub grads: Vec<Vec<PartitionedTensor<R>>>,
}

fn check_sources<T>(grads_list: &[Vec<T>], num_towers: usize) -> Result<()> {
    if grads_list.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "grads_list",
            reason: "at least one gradient source is required".to_string(),
        });
    }
    if let Some(bad) = grads_list.iter().find(|s| s.len() != num_towers) {
        return Err(Error::InvalidArgument {
            arg: "grads_list",
            reason: format!(
                "each source needs one gradient per tower ({num_towers}), got {}",
                bad.len()
            ),
        });
    }
    Ok(())
}

/// Batch sizes registered with blocks that only see parameter gradients.
#[derive(Debug, Clone, Default)]
pub struct BatchSizeTowers {
    batch_sizes: Vec<usize>,
}

impl BatchSizeTowers {
    pub fn register(&mut self, batch_size: usize) {
        self.batch_sizes.push(batch_size);
    }

    pub fn num_towers(&self) -> usize {
        self.batch_sizes.len()
    }

    /// Effective batch size: the sum over towers.
    pub fn batch_size(&self) -> usize {
        self.batch_sizes.iter().sum()
    }
}

/// Per-tower `(inputs, outputs)` pairs of a layer used once per tower.
pub struct InputOutputTowers<R: Runtime> {
    inputs: Vec<TrackedTensor<R>>,
    outputs: Vec<TrackedTensor<R>>,
}

impl<R: Runtime> Default for InputOutputTowers<R> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl<R: Runtime<DType = DType>> InputOutputTowers<R> {
    pub fn register(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.inputs.push(TrackedTensor::new(inputs));
        self.outputs.push(TrackedTensor::new(outputs));
    }

    pub fn num_towers(&self) -> usize {
        debug_assert_eq!(self.inputs.len(), self.outputs.len());
        self.inputs.len()
    }

    /// Shape of the first registered input, before any merging.
    pub fn first_input_shape(&self) -> Option<&[usize]> {
        self.inputs.first().map(|t| t.tensor().shape())
    }

    pub fn outputs(&self) -> Vec<&Tensor<R>> {
        self.outputs.iter().map(TrackedTensor::tensor).collect()
    }

    /// Canonicalize inputs and the supplied `grads_list[source][tower]`.
    pub fn canonicalize(
        &self,
        strategy: TowerStrategy,
        grads_list: &[Vec<Tensor<R>>],
    ) -> Result<CanonicalData<R>> {
        let num_towers = self.num_towers();
        check_sources(grads_list, num_towers)?;
        let track =
            |towers: &[Tensor<R>]| towers.iter().map(TrackedTensor::new).collect::<Vec<_>>();

        match strategy {
            TowerStrategy::Concat => Ok(CanonicalData {
                inputs: vec![PartitionedTensor::new(self.inputs.clone())?],
                grads: grads_list
                    .iter()
                    .map(|source| -> Result<Vec<PartitionedTensor<R>>> {
                        Ok(vec![PartitionedTensor::new(track(source.as_slice()))?])
                    })
                    .collect::<Result<_>>()?,
            }),
            TowerStrategy::Separate => Ok(CanonicalData {
                inputs: self
                    .inputs
                    .iter()
                    .cloned()
                    .map(PartitionedTensor::single)
                    .collect(),
                grads: grads_list
                    .iter()
                    .map(|source| {
                        track(source.as_slice())
                            .into_iter()
                            .map(PartitionedTensor::single)
                            .collect()
                    })
                    .collect(),
            }),
        }
    }
}

/// Number of uses implied by a list of per-tower data, if any.
fn infer_uses<T>(towers: &[&Uses<T>], what: &str) -> Result<Option<usize>> {
    let Some(first) = towers.first() else {
        return Ok(None);
    };
    let expected = first.explicit_len();
    if towers.iter().any(|t| t.explicit_len() != expected) {
        return Err(Error::UseCount {
            reason: format!("length of {what} is inconsistent across towers"),
        });
    }
    Ok(expected)
}

fn reconcile(current: Option<usize>, inferred: Option<usize>, what: &str) -> Result<Option<usize>> {
    match (current, inferred) {
        (Some(c), Some(i)) if c != i => Err(Error::UseCount {
            reason: format!("num_uses ({c}) doesn't match length of {what} ({i})"),
        }),
        (Some(c), _) => Ok(Some(c)),
        (None, inferred) => Ok(inferred),
    }
}

/// Split one tower's data into per-use parts.
fn per_use<R: Runtime<DType = DType>>(
    data: &Uses<TrackedTensor<R>>,
    num_uses: usize,
) -> Result<Vec<TrackedTensor<R>>> {
    match data {
        Uses::PerUse(parts) => Ok(parts.clone()),
        Uses::Folded(t) => {
            let rows = t.tensor().shape().first().copied().unwrap_or(0);
            if num_uses == 0 || rows % num_uses != 0 {
                return Err(Error::InvalidArgument {
                    arg: "inputs",
                    reason: format!("{rows} folded rows do not split into {num_uses} uses"),
                });
            }
            let per = rows / num_uses;
            (0..num_uses).map(|u| t.rows(u * per, per)).collect()
        }
    }
}

/// Per-tower data of a layer used several times per tower.
pub struct MultiUseTowers<R: Runtime> {
    inputs: Vec<Uses<TrackedTensor<R>>>,
    outputs: Vec<Uses<TrackedTensor<R>>>,
    num_uses: Option<usize>,
}

impl<R: Runtime<DType = DType>> MultiUseTowers<R> {
    /// `num_uses` may be omitted when per-use lists are registered.
    pub fn new(num_uses: Option<usize>) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            num_uses,
        }
    }

    pub fn register(&mut self, inputs: &Uses<Tensor<R>>, outputs: &Uses<Tensor<R>>) {
        self.inputs.push(Self::track(inputs));
        self.outputs.push(Self::track(outputs));
    }

    fn track(data: &Uses<Tensor<R>>) -> Uses<TrackedTensor<R>> {
        match data {
            Uses::PerUse(parts) => Uses::PerUse(parts.iter().map(TrackedTensor::new).collect()),
            Uses::Folded(t) => Uses::Folded(TrackedTensor::new(t)),
        }
    }

    pub fn num_towers(&self) -> usize {
        debug_assert_eq!(self.inputs.len(), self.outputs.len());
        self.inputs.len()
    }

    /// Use count given at construction, if any.
    pub fn configured_num_uses(&self) -> Option<usize> {
        self.num_uses
    }

    /// Shape of the first registered input (first use when per-use).
    pub fn first_input_shape(&self) -> Option<&[usize]> {
        self.inputs.first().and_then(|data| match data {
            Uses::PerUse(parts) => parts.first().map(|t| t.tensor().shape()),
            Uses::Folded(t) => Some(t.tensor().shape()),
        })
    }

    pub fn outputs(&self) -> Vec<&Tensor<R>> {
        self.outputs
            .iter()
            .flat_map(|data| match data {
                Uses::PerUse(parts) => parts.iter().map(TrackedTensor::tensor).collect::<Vec<_>>(),
                Uses::Folded(t) => vec![t.tensor()],
            })
            .collect()
    }

    /// Determine the number of uses from the configured value, the inputs,
    /// and the supplied gradients, requiring all of them to agree.
    pub fn resolve_num_uses(&self, grads_list: &[Vec<Uses<Tensor<R>>>]) -> Result<usize> {
        let inputs: Vec<&Uses<TrackedTensor<R>>> = self.inputs.iter().collect();
        let mut num_uses = reconcile(self.num_uses, infer_uses(&inputs, "inputs")?, "inputs")?;
        for source in grads_list {
            let grads: Vec<&Uses<Tensor<R>>> = source.iter().collect();
            num_uses = reconcile(num_uses, infer_uses(&grads, "outputs")?, "outputs")?;
        }
        num_uses.ok_or_else(|| Error::UseCount {
            reason: "num_uses must be given when every tensor is folded".to_string(),
        })
    }

    /// Canonicalize inputs and `grads_list[source][tower]`, returning the
    /// resolved number of uses alongside.
    pub fn canonicalize(
        &self,
        strategy: TowerStrategy,
        grads_list: &[Vec<Uses<Tensor<R>>>],
    ) -> Result<(CanonicalData<R>, usize)> {
        let num_towers = self.num_towers();
        check_sources(grads_list, num_towers)?;
        let num_uses = self.resolve_num_uses(grads_list)?;

        let grads_tracked: Vec<Vec<Uses<TrackedTensor<R>>>> = grads_list
            .iter()
            .map(|source| source.iter().map(Self::track).collect())
            .collect();

        let merge = |towers: &[Uses<TrackedTensor<R>>]| -> Result<Vec<PartitionedTensor<R>>> {
            match strategy {
                TowerStrategy::Concat => {
                    if let [Uses::Folded(t)] = towers {
                        return Ok(vec![PartitionedTensor::single(t.clone())]);
                    }
                    let split = towers
                        .iter()
                        .map(|t| per_use(t, num_uses))
                        .collect::<Result<Vec<_>>>()?;
                    for parts in &split {
                        if parts.len() != num_uses {
                            return Err(Error::UseCount {
                                reason: format!(
                                    "expected {num_uses} uses per tower, got {}",
                                    parts.len()
                                ),
                            });
                        }
                    }
                    let use_major = (0..num_uses)
                        .flat_map(|u| split.iter().map(move |parts| parts[u].clone()))
                        .collect();
                    Ok(vec![PartitionedTensor::new(use_major)?])
                }
                TowerStrategy::Separate => towers
                    .iter()
                    .map(|t| match t {
                        Uses::Folded(t) => Ok(PartitionedTensor::single(t.clone())),
                        Uses::PerUse(parts) => PartitionedTensor::new(parts.clone()),
                    })
                    .collect(),
            }
        };

        let data = CanonicalData {
            inputs: merge(self.inputs.as_slice())?,
            grads: grads_tracked
                .iter()
                .map(|source| merge(source.as_slice()))
                .collect::<Result<_>>()?,
        };
        Ok((data, num_uses))
    }
}
