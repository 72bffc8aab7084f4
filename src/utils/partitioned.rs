//! Lazily concatenated tensors with stable identity
//!
//! Blocks merge data from several towers and uses before handing it to a
//! factor. The merged batch is a [`PartitionedTensor`]: the parts are kept
//! as-is and only concatenated when a factor computes its statistics. A
//! factor's identity is derived from the identities of the parts
//! ([`PartKey`]), so two blocks fed from the same tensors share one factor.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

use crate::error::{Error, Result};
use crate::KfacClient;

/// Identity of one part: the registered tensor, and for use-folded tensors
/// that were split per use, the row range taken from it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartKey {
    pub id: TensorId,
    pub rows: Option<(usize, usize)>,
}

/// A tensor together with the identity it was registered under.
pub struct TrackedTensor<R: Runtime> {
    key: PartKey,
    tensor: Tensor<R>,
}

impl<R: Runtime> Clone for TrackedTensor<R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            tensor: self.tensor.clone(),
        }
    }
}

impl<R: Runtime<DType = DType>> TrackedTensor<R> {
    /// Track a caller-owned tensor. The id is read from the reference, so the
    /// same caller tensor always maps to the same key.
    pub fn new(tensor: &Tensor<R>) -> Self {
        Self {
            key: PartKey {
                id: tensor.id(),
                rows: None,
            },
            tensor: tensor.clone(),
        }
    }

    pub fn key(&self) -> PartKey {
        self.key
    }

    pub fn tensor(&self) -> &Tensor<R> {
        &self.tensor
    }

    /// Rows `[start, start + len)` along dim 0, keyed by the parent's identity.
    pub fn rows(&self, start: usize, len: usize) -> Result<Self> {
        let base = self.key.rows.map_or(0, |(s, _)| s);
        Ok(Self {
            key: PartKey {
                id: self.key.id,
                rows: Some((base + start, len)),
            },
            tensor: self.tensor.narrow(0, start, len)?,
        })
    }
}

/// A list of tensors that behaves like their concatenation along dim 0.
pub struct PartitionedTensor<R: Runtime> {
    parts: Vec<TrackedTensor<R>>,
}

impl<R: Runtime> Clone for PartitionedTensor<R> {
    fn clone(&self) -> Self {
        Self {
            parts: self.parts.clone(),
        }
    }
}

impl<R: Runtime> std::fmt::Debug for PartitionedTensor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shapes: Vec<&[usize]> = self.parts.iter().map(|p| p.tensor.shape()).collect();
        f.debug_struct("PartitionedTensor")
            .field("parts", &shapes)
            .finish()
    }
}

impl<R: Runtime<DType = DType>> PartitionedTensor<R> {
    pub fn new(parts: Vec<TrackedTensor<R>>) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(Error::InvalidArgument {
                arg: "parts",
                reason: "partitioned tensor needs at least one part".to_string(),
            });
        };
        let trailing = &first.tensor().shape()[1..];
        for part in &parts[1..] {
            if part.tensor().shape().len() != first.tensor().shape().len()
                || &part.tensor().shape()[1..] != trailing
            {
                return Err(Error::InvalidArgument {
                    arg: "parts",
                    reason: format!(
                        "part shapes {:?} and {:?} differ beyond dim 0",
                        first.tensor().shape(),
                        part.tensor().shape()
                    ),
                });
            }
        }
        Ok(Self { parts })
    }

    pub fn single(part: TrackedTensor<R>) -> Self {
        Self { parts: vec![part] }
    }

    pub fn parts(&self) -> &[TrackedTensor<R>] {
        &self.parts
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn keys(&self) -> Vec<PartKey> {
        self.parts.iter().map(TrackedTensor::key).collect()
    }

    /// Shape of the concatenation.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = self.parts[0].tensor().shape().to_vec();
        shape[0] = self.parts.iter().map(|p| p.tensor().shape()[0]).sum();
        shape
    }

    /// Concatenate the parts along dim 0.
    pub fn materialize<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        match self.parts.as_slice() {
            [single] => Ok(single.tensor().clone()),
            parts => {
                let refs: Vec<&Tensor<R>> = parts.iter().map(|p| p.tensor()).collect();
                Ok(client.cat(&refs, 0)?)
            }
        }
    }
}

/// Data for a parameter used several times (e.g. once per time step):
/// either one tensor per use, or all uses folded use-major into dim 0.
#[derive(Debug, Clone)]
pub enum Uses<T> {
    PerUse(Vec<T>),
    Folded(T),
}

impl<T> Uses<T> {
    /// Number of uses, when it can be read off the structure.
    pub fn explicit_len(&self) -> Option<usize> {
        match self {
            Self::PerUse(v) => Some(v.len()),
            Self::Folded(_) => None,
        }
    }
}
