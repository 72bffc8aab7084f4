//! Memoizable deferred computations
//!
//! Damping values are passed around as [`PackagedFunc`]s: a zero-argument
//! computation paired with a structural identity. Factors key their cached
//! inverses and matrix powers by the resolved identity ([`FuncKey`]), so two
//! thunks with equal identities share one cached result.
//!
//! Identity elements may themselves be deferred ([`IdElem::Lazy`]). They are
//! resolved every time [`PackagedFunc::func_id`] is called, which lets an
//! adjustable damping value contribute its *current* value to the key.
//! Each deferred element also names a stable source, so
//! [`PackagedFunc::slot_id`] identifies the thunk independently of the value
//! it currently reads.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// A hashable identity atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdAtom {
    Str(String),
    Int(i64),
    /// Canonical IEEE-754 bits (`-0.0` folds to `0.0`, all NaNs fold together).
    Float(u64),
}

impl IdAtom {
    pub fn float(value: f64) -> Self {
        let canonical = if value == 0.0 {
            0.0
        } else if value.is_nan() {
            f64::NAN
        } else {
            value
        };
        Self::Float(canonical.to_bits())
    }
}

impl fmt::Display for IdAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}

/// One element of a [`FuncId`].
#[derive(Clone)]
pub enum IdElem {
    Atom(IdAtom),
    /// Resolved on demand; `source` names what it reads.
    Lazy {
        source: IdAtom,
        resolve: Arc<dyn Fn() -> IdAtom + Send + Sync>,
    },
}

impl IdElem {
    pub fn lazy<F>(source: IdAtom, f: F) -> Self
    where
        F: Fn() -> IdAtom + Send + Sync + 'static,
    {
        Self::Lazy {
            source,
            resolve: Arc::new(f),
        }
    }

    fn resolve(&self) -> IdAtom {
        match self {
            Self::Atom(atom) => atom.clone(),
            Self::Lazy { resolve, .. } => resolve(),
        }
    }

    fn source(&self) -> IdAtom {
        match self {
            Self::Atom(atom) => atom.clone(),
            Self::Lazy { source, .. } => source.clone(),
        }
    }
}

impl fmt::Debug for IdElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(atom) => write!(f, "{atom}"),
            Self::Lazy { source, .. } => write!(f, "<lazy {source}>"),
        }
    }
}

impl From<IdAtom> for IdElem {
    fn from(atom: IdAtom) -> Self {
        Self::Atom(atom)
    }
}

impl From<&str> for IdElem {
    fn from(s: &str) -> Self {
        Self::Atom(IdAtom::Str(s.to_string()))
    }
}

impl From<String> for IdElem {
    fn from(s: String) -> Self {
        Self::Atom(IdAtom::Str(s))
    }
}

impl From<f64> for IdElem {
    fn from(value: f64) -> Self {
        Self::Atom(IdAtom::float(value))
    }
}

impl From<usize> for IdElem {
    fn from(value: usize) -> Self {
        Self::Atom(IdAtom::Int(value as i64))
    }
}

impl From<i64> for IdElem {
    fn from(value: i64) -> Self {
        Self::Atom(IdAtom::Int(value))
    }
}

/// Structural identity of a deferred computation.
#[derive(Debug, Clone, Default)]
pub struct FuncId(Vec<IdElem>);

impl FuncId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element, builder style.
    pub fn with(mut self, elem: impl Into<IdElem>) -> Self {
        self.0.push(elem.into());
        self
    }

    /// Append all elements of `other`.
    pub fn extended(mut self, other: &FuncId) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate every lazy element and return a hashable key.
    pub fn resolve(&self) -> FuncKey {
        FuncKey(self.0.iter().map(IdElem::resolve).collect())
    }

    /// Key with every lazy element replaced by its source. Stable across
    /// changes to the values lazy elements read.
    pub fn slot(&self) -> FuncKey {
        FuncKey(self.0.iter().map(IdElem::source).collect())
    }
}

/// Fully resolved, hashable identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncKey(Vec<IdAtom>);

impl FuncKey {
    pub fn atoms(&self) -> &[IdAtom] {
        &self.0
    }
}

/// A zero-argument computation together with its identity.
pub struct PackagedFunc<T> {
    func: Arc<dyn Fn() -> Result<T> + Send + Sync>,
    id: FuncId,
}

impl<T> Clone for PackagedFunc<T> {
    fn clone(&self) -> Self {
        Self {
            func: Arc::clone(&self.func),
            id: self.id.clone(),
        }
    }
}

impl<T> fmt::Debug for PackagedFunc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagedFunc").field("id", &self.id).finish()
    }
}

impl<T> PackagedFunc<T> {
    pub fn new<F>(func: F, id: FuncId) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            id,
        }
    }

    /// Run the computation.
    pub fn call(&self) -> Result<T> {
        (self.func)()
    }

    /// Resolved identity, recomputed on every call.
    pub fn func_id(&self) -> FuncKey {
        self.id.resolve()
    }

    /// Identity with lazy elements left unresolved; see [`FuncId::slot`].
    pub fn slot_id(&self) -> FuncKey {
        self.id.slot()
    }

    /// Unresolved identity, for composing derived identities.
    pub fn raw_id(&self) -> &FuncId {
        &self.id
    }
}

/// A damping thunk.
pub type DampingFunc = PackagedFunc<f64>;

/// A named damping value that can be adjusted after blocks are built.
#[derive(Debug, Clone)]
pub struct SharedDamping {
    name: String,
    value: Arc<Mutex<f64>>,
}

impl SharedDamping {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(Mutex::new(value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> f64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, value: f64) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

/// Damping supplied to a block at factor instantiation.
#[derive(Debug, Clone)]
pub enum Damping {
    Constant(f64),
    Shared(SharedDamping),
}

impl Damping {
    /// Current damping value.
    pub fn value(&self) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Shared(shared) => shared.get(),
        }
    }

    /// Identity element for this damping. Shared values resolve to whatever
    /// they hold when the identity is resolved.
    pub fn id_elem(&self) -> IdElem {
        match self {
            Self::Constant(v) => IdElem::from(*v),
            Self::Shared(shared) => {
                let shared = shared.clone();
                let source = IdAtom::Str(format!("shared:{}", shared.name()));
                IdElem::lazy(source, move || IdAtom::float(shared.get()))
            }
        }
    }

    /// Thunk returning the raw damping value with identity `(damping,)`.
    pub fn to_func(&self) -> DampingFunc {
        let damping = self.clone();
        PackagedFunc::new(
            move || Ok(damping.value()),
            FuncId::new().with(self.id_elem()),
        )
    }
}

impl From<f64> for Damping {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<SharedDamping> for Damping {
    fn from(shared: SharedDamping) -> Self {
        Self::Shared(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_ids_equal_keys() {
        let a = FuncId::new().with("normalize_damping").with(0.01).with(4usize);
        let b = FuncId::new().with("normalize_damping").with(0.01).with(4usize);
        assert_eq!(a.resolve(), b.resolve());
        let c = FuncId::new().with("normalize_damping").with(0.02).with(4usize);
        assert_ne!(a.resolve(), c.resolve());
    }

    #[test]
    fn test_negative_zero_folds() {
        assert_eq!(IdAtom::float(-0.0), IdAtom::float(0.0));
    }

    #[test]
    fn test_lazy_element_tracks_shared_value() {
        let shared = SharedDamping::new("lm_damping", 0.1);
        let func = Damping::from(shared.clone()).to_func();
        let before = func.func_id();
        assert!((func.call().unwrap() - 0.1).abs() < 1e-12);

        shared.set(0.5);
        let after = func.func_id();
        assert_ne!(before, after);
        assert_eq!(after.atoms(), &[IdAtom::float(0.5)]);
        assert!((func.call().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_slot_ignores_shared_value() {
        let shared = SharedDamping::new("lm_damping", 0.1);
        let func = Damping::from(shared.clone()).to_func();
        let slot = func.slot_id();
        shared.set(0.7);
        assert_eq!(func.slot_id(), slot);
        assert_eq!(slot.atoms(), &[IdAtom::Str("shared:lm_damping".to_string())]);

        let constant = Damping::Constant(0.1).to_func();
        assert_eq!(constant.slot_id(), constant.func_id());
    }

    #[test]
    fn test_extended_composes_identity() {
        let base = Damping::Constant(1e-3).to_func();
        let derived = FuncId::new()
            .extended(base.raw_id())
            .with("ref")
            .with(0usize);
        assert_eq!(derived.len(), 3);
        assert_eq!(
            derived.resolve().atoms()[1],
            IdAtom::Str("ref".to_string())
        );
    }
}
