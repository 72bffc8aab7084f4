//! Per-damping caches of factor powers

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::trace;

use crate::error::{Error, Result};
use crate::thunk::{DampingFunc, FuncKey, IdAtom};

/// Cache of values computed from a factor for a given exponent and damping.
///
/// Exponents are registered up front; values are computed the first time a
/// `(exponent, damping identity)` pair is requested and reused afterwards.
///
/// Entries are slotted by the damping's stable identity, so an adjustable
/// damping holds one value per exponent: when its resolved identity changes
/// the slot is recomputed and overwritten.
#[derive(Debug)]
pub(crate) struct PowerCache<V> {
    registered: Mutex<HashSet<IdAtom>>,
    values: Mutex<HashMap<(IdAtom, FuncKey), (FuncKey, V)>>,
}

impl<V> Default for PowerCache<V> {
    fn default() -> Self {
        Self {
            registered: Mutex::new(HashSet::new()),
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> PowerCache<V> {
    pub(crate) fn register(&self, exp: f64) {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(IdAtom::float(exp));
    }

    pub(crate) fn is_registered(&self, exp: f64) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&IdAtom::float(exp))
    }

    /// Number of cached values.
    pub(crate) fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Look up, or compute and store, the value for `(exp, damping)`.
    /// With `require_registered`, an unregistered exponent is a state error.
    pub(crate) fn get_or_compute<F>(
        &self,
        factor: &str,
        exp: f64,
        damping: &DampingFunc,
        require_registered: bool,
        compute: F,
    ) -> Result<V>
    where
        F: FnOnce(f64) -> Result<V>,
    {
        if require_registered && !self.is_registered(exp) {
            return Err(Error::State {
                reason: format!("power {exp} was never registered with factor {factor}"),
            });
        }
        let slot = (IdAtom::float(exp), damping.slot_id());
        let resolved = damping.func_id();
        if let Some((key, v)) = self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&slot)
        {
            if *key == resolved {
                return Ok(v.clone());
            }
        }

        let value = compute(damping.call()?)?;
        trace!(factor, exp, damping = ?resolved, "cached damped factor power");
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot, (resolved, value.clone()));
        Ok(value)
    }
}
