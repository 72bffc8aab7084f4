//! Curvature approximation configuration
//!
//! A [`KfacConfig`] is captured once by a [`LayerCollection`](crate::factors::LayerCollection)
//! and shared by every block and factor created through it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How data registered from several towers (data-parallel replicas) is combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TowerStrategy {
    /// Merge all towers into a single batch before computing statistics.
    #[default]
    Concat,
    /// Keep one batch per tower; factors average the per-tower statistics.
    Separate,
}

impl FromStr for TowerStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(Self::Concat),
            "separate" => Ok(Self::Separate),
            other => Err(Error::InvalidConfig {
                reason: format!(
                    "unrecognized tower strategy '{other}', expected 'concat' or 'separate'"
                ),
            }),
        }
    }
}

impl fmt::Display for TowerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concat => f.write_str("concat"),
            Self::Separate => f.write_str("separate"),
        }
    }
}

/// How damping is split between the two factors of a Kronecker product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiType {
    /// Balance the split by the ratio of the factors' average eigenvalues.
    #[default]
    Tracenorm,
    /// Give both factors the same damping.
    Off,
}

impl FromStr for PiType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tracenorm" => Ok(Self::Tracenorm),
            "off" => Ok(Self::Off),
            other => Err(Error::InvalidConfig {
                reason: format!("unrecognized pi type '{other}', expected 'tracenorm' or 'off'"),
            }),
        }
    }
}

impl fmt::Display for PiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracenorm => f.write_str("tracenorm"),
            Self::Off => f.write_str("off"),
        }
    }
}

fn default_normalize_damping_power() -> f64 {
    1.0
}

/// Settings shared by all Fisher blocks of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KfacConfig {
    #[serde(default)]
    pub tower_strategy: TowerStrategy,

    /// Exponent applied to the replication count when normalizing damping.
    /// Zero disables normalization.
    #[serde(default = "default_normalize_damping_power")]
    pub normalize_damping_power: f64,

    #[serde(default)]
    pub pi_type: PiType,
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            tower_strategy: TowerStrategy::Concat,
            normalize_damping_power: default_normalize_damping_power(),
            pi_type: PiType::Tracenorm,
        }
    }
}

impl KfacConfig {
    pub fn with_tower_strategy(mut self, strategy: TowerStrategy) -> Self {
        self.tower_strategy = strategy;
        self
    }

    pub fn with_normalize_damping_power(mut self, power: f64) -> Self {
        self.normalize_damping_power = power;
        self
    }

    pub fn with_pi_type(mut self, pi_type: PiType) -> Self {
        self.pi_type = pi_type;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if !self.normalize_damping_power.is_finite() {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "normalize_damping_power must be finite, got {}",
                    self.normalize_damping_power
                ),
            });
        }
        Ok(())
    }

    /// Load config from YAML file
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::InvalidConfig {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from JSON file
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::InvalidConfig {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}
