//! Dense layers shared across the time steps of a sequence model
//!
//! Unlike the independent-uses block, this one models the correlation
//! between consecutive time steps through each factor's lag-one moment.
//! Two closed-form approximations to the resulting inverse are available:
//!
//! - `Option1` treats the lag-one moment as symmetric.
//! - `Option2` assumes infinitely long sequences.
//!
//! Only inverse multiplication is supported.

use std::fmt;
use std::str::FromStr;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::block::{already_instantiated, no_towers, FisherBlock};
use super::kronecker::{core_of, KroneckerProductFB};
use super::towers::MultiUseTowers;
use crate::error::{Error, Result};
use crate::factors::{CovarianceFactor, FactorSpec, LayerCollection, SeriesFactor};
use crate::thunk::Damping;
use crate::utils::host::{from_host, to_host};
use crate::utils::{layer_params_to_mat2d, mat2d_to_layer_params, LayerParams, Uses};
use crate::KfacClient;

/// Simplifying assumption used by [`FullyConnectedSeriesFB`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesApproximation {
    /// Symmetric lag-one cross-covariance.
    Option1,
    /// Infinitely long training sequences.
    #[default]
    Option2,
}

impl FromStr for SeriesApproximation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "option1" => Ok(Self::Option1),
            "option2" => Ok(Self::Option2),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown series approximation '{other}'"),
            }),
        }
    }
}

impl fmt::Display for SeriesApproximation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Option1 => f.write_str("option1"),
            Self::Option2 => f.write_str("option2"),
        }
    }
}

/// `γ(x) = (1 − x)² / (T(1 − x²) − 2x(1 − x^T))` for `T` time steps.
pub fn series_gamma(x: f64, num_timesteps: f64) -> f64 {
    let t = num_timesteps;
    (1.0 - x).powi(2) / (t * (1.0 - x * x) - 2.0 * x * (1.0 - x.powf(t)))
}

/// Row-major `1 − μ_G μ_Aᵀ`, with exact zeros replaced by one.
pub fn option2_denominator(mu_g: &[f64], mu_a: &[f64]) -> Vec<f64> {
    mu_g.iter()
        .flat_map(|g| {
            mu_a.iter().map(move |a| {
                let d = 1.0 - g * a;
                if d == 0.0 {
                    1.0
                } else {
                    d
                }
            })
        })
        .collect()
}

fn unsupported_power(exp: f64) -> Error {
    Error::Unsupported {
        feature: format!(
            "FullyConnectedSeriesFB only supports inverse multiplication, got power {exp}"
        ),
    }
}

fn t<R: Runtime<DType = DType>>(x: &Tensor<R>) -> Result<Tensor<R>> {
    Ok(x.transpose(-2, -1)?.contiguous()?)
}

/// Dense layer shared across time steps, modelled with temporally
/// correlated Kronecker factors.
pub struct FullyConnectedSeriesFB<R: Runtime> {
    has_bias: bool,
    option: SeriesApproximation,
    towers: MultiUseTowers<R>,
    num_timesteps: Option<usize>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> FullyConnectedSeriesFB<R> {
    /// `num_uses` (the number of time steps) is only required when every
    /// tensor is registered folded.
    pub fn new(has_bias: bool, num_uses: Option<usize>, option: SeriesApproximation) -> Self {
        Self {
            has_bias,
            option,
            towers: MultiUseTowers::new(num_uses),
            num_timesteps: None,
            core: None,
        }
    }

    pub fn register_additional_tower(
        &mut self,
        inputs: &Uses<Tensor<R>>,
        outputs: &Uses<Tensor<R>>,
    ) {
        self.towers.register(inputs, outputs);
    }

    pub fn option(&self) -> SeriesApproximation {
        self.option
    }

    /// Resolved number of time steps, known once instantiated.
    pub fn num_timesteps(&self) -> Option<usize> {
        self.num_timesteps
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "FullyConnectedSeriesFB")
    }

    fn multiply_option1<C: KfacClient<R>>(
        &self,
        client: &C,
        core: &KroneckerProductFB<R>,
        z: Tensor<R>,
        num_timesteps: f64,
    ) -> Result<Tensor<R>> {
        let (l_a, psi_a) = core.input_factor().get_option1quants(core.input_damping())?;
        let (l_g, psi_g) = core.output_factor().get_option1quants(core.output_damping())?;

        let psi_a = to_host(&psi_a)?;
        let psi_g = to_host(&psi_g)?;
        let y: Vec<f64> = psi_g
            .iter()
            .flat_map(|g| psi_a.iter().map(move |a| series_gamma(g * a, num_timesteps)))
            .collect();
        let y = from_host::<R>(&y, &[psi_g.len(), psi_a.len()], z.device())?;

        // Z = L_Gᵀ Z L_A
        let z = client.matmul(&t(&l_g)?, &client.matmul(&z, &l_a)?)?;
        let z = client.mul(&z, &y)?;
        // Z = L_G Z L_Aᵀ
        Ok(client.matmul(&l_g, &client.matmul(&z, &t(&l_a)?)?)?)
    }

    fn multiply_option2<C: KfacClient<R>>(
        &self,
        client: &C,
        core: &KroneckerProductFB<R>,
        z: Tensor<R>,
        num_timesteps: f64,
    ) -> Result<Tensor<R>> {
        let (p_a, k_a, mu_a) = core.input_factor().get_option2quants(core.input_damping())?;
        let (p_g, k_g, mu_g) = core.output_factor().get_option2quants(core.output_damping())?;

        // Z = Z - P_G Z P_Aᵀ
        let z = client.sub(&z, &client.matmul(&p_g, &client.matmul(&z, &t(&p_a)?)?)?)?;
        // Z = K_Gᵀ Z K_A
        let z = client.matmul(&t(&k_g)?, &client.matmul(&z, &k_a)?)?;

        let mu_a = to_host(&mu_a)?;
        let mu_g = to_host(&mu_g)?;
        let denom = from_host::<R>(
            &option2_denominator(&mu_g, &mu_a),
            &[mu_g.len(), mu_a.len()],
            z.device(),
        )?;
        let z = client.div(&z, &denom)?;

        // Z = K_G Z K_Aᵀ
        let z = client.matmul(&k_g, &client.matmul(&z, &t(&k_a)?)?)?;
        // Z = Z - P_Gᵀ Z P_A
        let z = client.sub(&z, &client.matmul(&t(&p_g)?, &client.matmul(&z, &p_a)?)?)?;
        Ok(client.mul_scalar(&z, 1.0 / num_timesteps)?)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for FullyConnectedSeriesFB<R> {
    type Grads = [Vec<Uses<Tensor<R>>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Uses<Tensor<R>>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("FullyConnectedSeriesFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("FullyConnectedSeriesFB"));
        }
        let config = *collection.config();
        let (data, num_uses) = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let input = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedMultiKronecker {
                tensors: vec![data.inputs],
                num_uses,
                has_bias: self.has_bias,
            },
        )?;
        input.register_cov_dt1(client)?;
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedMultiKronecker {
                tensors: data.grads,
                num_uses,
                has_bias: false,
            },
        )?;
        output.register_cov_dt1(client)?;
        debug!(
            input = input.name(),
            output = output.name(),
            num_uses,
            option = %self.option,
            "FullyConnectedSeriesFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config,
            input,
            output,
            damping,
            Some(num_uses),
            num_uses as f64,
        )?);
        self.num_timesteps = Some(num_uses);
        Ok(())
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        if exp != -1.0 {
            return Err(unsupported_power(exp));
        }
        let core = self.kronecker()?;
        match self.option {
            SeriesApproximation::Option1 => {
                core.input_factor().register_option1quants(core.input_damping());
                core.output_factor().register_option1quants(core.output_damping());
            }
            SeriesApproximation::Option2 => {
                core.input_factor().register_option2quants(core.input_damping());
                core.output_factor().register_option2quants(core.output_damping());
            }
        }
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        if exp != -1.0 {
            return Err(unsupported_power(exp));
        }
        let core = self.kronecker()?;
        let num_timesteps = self.num_timesteps.unwrap_or(1) as f64;

        // The closed forms are written for [out, in].
        let z = t(&layer_params_to_mat2d(client, vector)?)?;
        let z = match self.option {
            SeriesApproximation::Option1 => self.multiply_option1(client, core, z, num_timesteps)?,
            SeriesApproximation::Option2 => self.multiply_option2(client, core, z, num_timesteps)?,
        };
        mat2d_to_layer_params(vector, &t(&z)?)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.towers.outputs()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}
