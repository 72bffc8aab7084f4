//! Kronecker-factored blocks
//!
//! Every block in this family models its Fisher block as `c · (A ⊗ G)`, with
//! `A` the input-side factor, `G` the output-side factor and `c` a
//! renormalization coefficient (the number of conv locations, uses, or 1).
//! The shared arithmetic lives in [`KroneckerProductFB`]; the variants differ
//! in which factors they request from the collection and in `c`.

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::debug;

use super::block::{already_instantiated, no_towers, not_instantiated, FisherBlock};
use super::conv::num_conv_locations;
use super::towers::InputOutputTowers;
use crate::config::KfacConfig;
use crate::damping::{compute_pi_adjusted_damping, normalize_damping};
use crate::error::{Error, Result};
use crate::factors::{
    CovarianceFactor, FactorSpec, KroneckerFactor, LayerCollection, MatpowerFactor,
};
use crate::thunk::{Damping, DampingFunc, FuncId, PackagedFunc};
use crate::utils::host::diag_to_dense;
use crate::utils::{
    kronecker_product, layer_params_to_mat2d, mat2d_to_layer_params, ConvGeometry, DataFormat,
    LayerParams, Padding, PatchExtractor,
};
use crate::KfacClient;

/// Covariance as a dense matrix, expanding diagonal factors.
pub(crate) fn dense_cov<R: Runtime<DType = DType>>(
    factor: &KroneckerFactor<R>,
) -> Result<Tensor<R>> {
    if factor.is_diagonal() {
        diag_to_dense(factor.get_cov())
    } else {
        Ok(factor.get_cov().clone())
    }
}

/// Input and output factors of a Kronecker-factored block, with their damping.
pub struct KroneckerProductFB<R: Runtime> {
    input: Arc<KroneckerFactor<R>>,
    output: Arc<KroneckerFactor<R>>,
    input_damping: DampingFunc,
    output_damping: DampingFunc,
    renorm_coeff: f64,
}

impl<R: Runtime<DType = DType>> KroneckerProductFB<R> {
    /// Split `damping` between the two factors.
    ///
    /// Each factor receives `sqrt(d)` scaled by the pi adjustment, where `d`
    /// is `damping` normalized by `normalization` when one is given.
    pub fn new(
        config: &KfacConfig,
        input: Arc<KroneckerFactor<R>>,
        output: Arc<KroneckerFactor<R>>,
        damping: &Damping,
        normalization: Option<usize>,
        renorm_coeff: f64,
    ) -> Result<Self> {
        // Statistics are fixed once built, so pi is too.
        let scales = compute_pi_adjusted_damping(
            config.pi_type,
            input.get_cov(),
            output.get_cov(),
            1.0,
        )?;

        let mut id = FuncId::new()
            .with("compute_pi_adjusted_damping")
            .with("cov")
            .with(input.name())
            .with("cov")
            .with(output.name());
        id = match normalization {
            Some(n) => id.with("normalize_damping").with(damping.id_elem()).with(n),
            None => id.with(damping.id_elem()),
        };
        id = id.with("power").with(0.5);

        let make = |index: usize, scale: f64| {
            let config = *config;
            let damping = damping.clone();
            PackagedFunc::new(
                move || {
                    let mut d = damping.value();
                    if let Some(n) = normalization {
                        d = normalize_damping(&config, d, n as f64);
                    }
                    Ok(d.sqrt() * scale)
                },
                id.clone().with("ref").with(index),
            )
        };
        let input_damping = make(0, scales.0);
        let output_damping = make(1, scales.1);

        Ok(Self {
            input,
            output,
            input_damping,
            output_damping,
            renorm_coeff,
        })
    }

    pub fn input_factor(&self) -> &Arc<KroneckerFactor<R>> {
        &self.input
    }

    pub fn output_factor(&self) -> &Arc<KroneckerFactor<R>> {
        &self.output
    }

    pub fn input_damping(&self) -> &DampingFunc {
        &self.input_damping
    }

    pub fn output_damping(&self) -> &DampingFunc {
        &self.output_damping
    }

    /// `c` in `c · (A ⊗ G)`.
    pub fn renorm_coeff(&self) -> f64 {
        self.renorm_coeff
    }

    pub fn register_matpower(&self, exp: f64) {
        self.input.register_matpower(exp, &self.input_damping);
        self.output.register_matpower(exp, &self.output_damping);
    }

    /// `c^exp · (A + dA)^exp · V · (G + dG)^exp` with `V` in `[in(+1), out]` form.
    pub fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        let mat = layer_params_to_mat2d(client, vector)?;
        let out = self
            .output
            .right_multiply_matpower(client, &mat, exp, &self.output_damping)?;
        let mut out = self
            .input
            .left_multiply_matpower(client, &out, exp, &self.input_damping)?;
        if self.renorm_coeff != 1.0 {
            out = client.mul_scalar(&out, self.renorm_coeff.powf(exp))?;
        }
        mat2d_to_layer_params(vector, &out)
    }

    /// `c · kron(A, G)`, undamped.
    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        let a = dense_cov(&self.input)?;
        let g = dense_cov(&self.output)?;
        let kron = kronecker_product(client, &a, &g)?;
        if self.renorm_coeff == 1.0 {
            Ok(kron)
        } else {
            Ok(client.mul_scalar(&kron, self.renorm_coeff)?)
        }
    }
}

/// Shorthand for the instantiated state of a Kronecker-factored block.
pub(crate) fn core_of<'a, R: Runtime<DType = DType>>(
    core: &'a Option<KroneckerProductFB<R>>,
    block: &str,
) -> Result<&'a KroneckerProductFB<R>> {
    core.as_ref().ok_or_else(|| not_instantiated(block))
}

pub(crate) fn reject_bias<R: Runtime<DType = DType>>(
    vector: &LayerParams<R>,
    block: &'static str,
) -> Result<()> {
    if vector.has_bias() {
        return Err(Error::Unsupported {
            feature: format!("bias parameters in {block}"),
        });
    }
    Ok(())
}

/// K-FAC block for dense layers.
pub struct FullyConnectedKFACBasicFB<R: Runtime> {
    has_bias: bool,
    towers: InputOutputTowers<R>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> FullyConnectedKFACBasicFB<R> {
    pub fn new(has_bias: bool) -> Self {
        Self {
            has_bias,
            towers: InputOutputTowers::default(),
            core: None,
        }
    }

    /// Register one tower's `[batch, in]` inputs and `[batch, out]` pre-activations.
    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.towers.register(inputs, outputs);
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "FullyConnectedKFACBasicFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for FullyConnectedKFACBasicFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("FullyConnectedKFACBasicFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("FullyConnectedKFACBasicFB"));
        }
        let config = *collection.config();
        let data = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let input = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedKronecker {
                tensors: vec![data.inputs],
                has_bias: self.has_bias,
            },
        )?;
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedKronecker {
                tensors: data.grads,
                has_bias: false,
            },
        )?;
        debug!(
            input = input.name(),
            output = output.name(),
            "FullyConnectedKFACBasicFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config, input, output, damping, None, 1.0,
        )?);
        Ok(())
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        self.kronecker()?.register_matpower(exp);
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        self.kronecker()?.multiply_matpower(client, vector, exp)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.towers.outputs()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}

/// KFC block for 2-D convolutions: `F ≈ #locations · (E[pp ᵀ] ⊗ E[ds dsᵀ])`
/// over image patches `p` and per-location output gradients `ds`.
pub struct ConvKFCBasicFB<R: Runtime> {
    filter_shape: Vec<usize>,
    strides: Vec<usize>,
    geometry: ConvGeometry,
    has_bias: bool,
    towers: InputOutputTowers<R>,
    num_locations: Option<usize>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> ConvKFCBasicFB<R> {
    /// `strides` and `dilations` are spatial (`[sy, sx]`) for
    /// [`PatchExtractor::Convolution`], `[1, sy, sx, 1]` for image patches.
    pub fn new(
        params: &LayerParams<R>,
        padding: Padding,
        strides: &[usize],
        dilations: Option<&[usize]>,
        data_format: DataFormat,
        extractor: PatchExtractor,
    ) -> Result<Self> {
        let filter_shape = params.weight_shape()?.to_vec();
        Self::with_filter_shape(
            filter_shape,
            params.has_bias(),
            padding,
            strides,
            dilations,
            data_format,
            extractor,
        )
    }

    pub(crate) fn with_filter_shape(
        filter_shape: Vec<usize>,
        has_bias: bool,
        padding: Padding,
        strides: &[usize],
        dilations: Option<&[usize]>,
        data_format: DataFormat,
        extractor: PatchExtractor,
    ) -> Result<Self> {
        data_format.require_channels_last()?;
        let geometry = ConvGeometry::new(&filter_shape, strides, dilations, padding, extractor)?;
        Ok(Self {
            filter_shape,
            strides: strides.to_vec(),
            geometry,
            has_bias,
            towers: InputOutputTowers::default(),
            num_locations: None,
            core: None,
        })
    }

    /// Register one tower's `[N, H, W, C_in]` inputs and `[N, H', W', C_out]`
    /// pre-activations.
    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.towers.register(inputs, outputs);
    }

    pub fn filter_shape(&self) -> &[usize] {
        &self.filter_shape
    }

    /// Spatial locations the filter is applied at, known once instantiated.
    pub fn num_locations(&self) -> Option<usize> {
        self.num_locations
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "ConvKFCBasicFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for ConvKFCBasicFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("ConvKFCBasicFB"));
        }
        let input_shape = self
            .towers
            .first_input_shape()
            .ok_or_else(|| no_towers("ConvKFCBasicFB"))?;
        let num_locations = num_conv_locations(input_shape, Some(&self.strides));

        let config = *collection.config();
        let data = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let input = collection.make_or_get_kronecker(
            client,
            FactorSpec::ConvInputKronecker {
                inputs: data.inputs,
                geometry: self.geometry,
                has_bias: self.has_bias,
            },
        )?;
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::ConvOutputKronecker { grads: data.grads },
        )?;
        debug!(
            input = input.name(),
            output = output.name(),
            num_locations,
            "ConvKFCBasicFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config,
            input,
            output,
            damping,
            Some(num_locations),
            num_locations as f64,
        )?);
        self.num_locations = Some(num_locations);
        Ok(())
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        self.kronecker()?.register_matpower(exp);
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        self.kronecker()?.multiply_matpower(client, vector, exp)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.towers.outputs()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}

/// K-FAC block for embedding lookups. The input factor is diagonal over the
/// vocabulary, which is exact when every example references one id.
pub struct EmbeddingKFACFB<R: Runtime> {
    vocab_size: usize,
    towers: InputOutputTowers<R>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> EmbeddingKFACFB<R> {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            towers: InputOutputTowers::default(),
            core: None,
        }
    }

    /// Register one tower's integer ids and `[batch, dim]` embedding outputs.
    pub fn register_additional_tower(&mut self, ids: &Tensor<R>, outputs: &Tensor<R>) {
        self.towers.register(ids, outputs);
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "EmbeddingKFACFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for EmbeddingKFACFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("EmbeddingKFACFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("EmbeddingKFACFB"));
        }
        let config = *collection.config();
        let data = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let input = collection.make_or_get_kronecker(
            client,
            FactorSpec::EmbeddingInputKronecker {
                inputs: data.inputs,
                vocab_size: self.vocab_size,
            },
        )?;
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedKronecker {
                tensors: data.grads,
                has_bias: false,
            },
        )?;
        debug!(
            input = input.name(),
            output = output.name(),
            "EmbeddingKFACFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config, input, output, damping, None, 1.0,
        )?);
        Ok(())
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        self.kronecker()?.register_matpower(exp);
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        reject_bias(vector, "EmbeddingKFACFB")?;
        self.kronecker()?.multiply_matpower(client, vector, exp)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.towers.outputs()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PiType;
    use crate::test_utils::cpu_setup;
    use crate::thunk::SharedDamping;
    use numr::runtime::cpu::CpuRuntime;

    fn dense_block() -> (
        numr::runtime::cpu::CpuClient,
        FullyConnectedKFACBasicFB<CpuRuntime>,
        LayerCollection<CpuRuntime>,
        Vec<Vec<Tensor<CpuRuntime>>>,
    ) {
        let (client, device) = cpu_setup();
        let x = Tensor::<CpuRuntime>::from_slice(
            &[1.0f32, 0.5, -1.0, 2.0, 0.0, 1.5, 0.3, -0.7],
            &[4, 2],
            &device,
        )
        .unwrap();
        let y = Tensor::<CpuRuntime>::from_slice(
            &[0.2f32, -0.4, 0.1, 0.9, -0.3, 0.5, 0.6, 0.05, -0.2, 0.3, 0.7, -0.1],
            &[4, 3],
            &device,
        )
        .unwrap();
        let mut block = FullyConnectedKFACBasicFB::new(true);
        block.register_additional_tower(&x, &y);
        let collection = LayerCollection::new(KfacConfig::default()).unwrap();
        (client, block, collection, vec![vec![y]])
    }

    #[test]
    fn test_damping_ids_and_product() {
        let (client, mut block, mut collection, grads) = dense_block();
        block
            .instantiate_factors(&client, &mut collection, &grads, &Damping::Constant(0.04))
            .unwrap();
        let core = block.kronecker().unwrap();
        let a = core.input_damping().call().unwrap();
        let g = core.output_damping().call().unwrap();
        assert!((a * g - 0.04).abs() < 1e-9);

        let id_a = core.input_damping().func_id();
        let id_g = core.output_damping().func_id();
        assert_ne!(id_a, id_g);
        assert_eq!(id_a.atoms().len(), 10);
    }

    #[test]
    fn test_pi_off_splits_evenly() {
        let (client, mut block, _, grads) = dense_block();
        let mut collection =
            LayerCollection::new(KfacConfig::default().with_pi_type(PiType::Off)).unwrap();
        block
            .instantiate_factors(&client, &mut collection, &grads, &Damping::Constant(0.09))
            .unwrap();
        let core = block.kronecker().unwrap();
        assert!((core.input_damping().call().unwrap() - 0.3).abs() < 1e-12);
        assert!((core.output_damping().call().unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_shared_damping_changes_cache_key() {
        let (client, mut block, mut collection, grads) = dense_block();
        let shared = SharedDamping::new("lambda", 0.01);
        block
            .instantiate_factors(&client, &mut collection, &grads, &Damping::from(shared.clone()))
            .unwrap();
        let before = block.kronecker().unwrap().input_damping().func_id();
        shared.set(0.1);
        let after = block.kronecker().unwrap().input_damping().func_id();
        assert_ne!(before, after);
    }

    #[test]
    fn test_multiply_requires_registration() {
        let (client, mut block, mut collection, grads) = dense_block();
        block
            .instantiate_factors(&client, &mut collection, &grads, &Damping::Constant(0.01))
            .unwrap();
        let (_, device) = cpu_setup();
        let v = LayerParams::with_bias(
            Tensor::<CpuRuntime>::ones(&[2, 3], DType::F32, &device).unwrap(),
            Tensor::<CpuRuntime>::ones(&[3], DType::F32, &device).unwrap(),
        );
        let err = block.multiply_inverse(&client, &v).unwrap_err();
        assert!(matches!(err, Error::State { .. }));

        block.register_inverse().unwrap();
        let out = block.multiply_inverse(&client, &v).unwrap();
        assert_eq!(out.tensors()[0].shape(), &[2, 3]);
        assert_eq!(out.tensors()[1].shape(), &[3]);
    }

    #[test]
    fn test_embedding_rejects_bias() {
        let (client, device) = cpu_setup();
        let ids = Tensor::<CpuRuntime>::from_slice(&[0i64, 1, 2, 1], &[4], &device).unwrap();
        let out = Tensor::<CpuRuntime>::from_slice(
            &[0.1f32, 0.2, -0.3, 0.4, 0.5, -0.6, 0.7, 0.8],
            &[4, 2],
            &device,
        )
        .unwrap();
        let mut block = EmbeddingKFACFB::new(3);
        block.register_additional_tower(&ids, &out);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![out.clone()]],
                &Damping::Constant(0.1),
            )
            .unwrap();
        block.register_inverse().unwrap();

        let w = Tensor::<CpuRuntime>::ones(&[3, 2], DType::F32, &device).unwrap();
        let b = Tensor::<CpuRuntime>::ones(&[2], DType::F32, &device).unwrap();
        let err = block
            .multiply_inverse(&client, &LayerParams::with_bias(w.clone(), b))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        assert!(block.multiply_inverse(&client, &LayerParams::weights(w)).is_ok());
    }

    #[test]
    fn test_conv_num_locations_and_renorm() {
        let (client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::zeros(&[1, 1, 2, 3], DType::F32, &device).unwrap();
        let mut block = ConvKFCBasicFB::new(
            &LayerParams::weights(w),
            Padding::Same,
            &[1, 1],
            None,
            DataFormat::ChannelsLast,
            PatchExtractor::Convolution,
        )
        .unwrap();
        let x_data: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let x = Tensor::<CpuRuntime>::from_slice(&x_data, &[2, 2, 2, 2], &device).unwrap();
        let y_data: Vec<f32> = (0..24).map(|i| (i as f32 * 0.61).cos()).collect();
        let y = Tensor::<CpuRuntime>::from_slice(&y_data, &[2, 2, 2, 3], &device).unwrap();
        block.register_additional_tower(&x, &y);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        block
            .instantiate_factors(&client, &mut collection, &[vec![y]], &Damping::Constant(0.1))
            .unwrap();
        assert_eq!(block.num_locations(), Some(4));
        assert_eq!(block.kronecker().unwrap().renorm_coeff(), 4.0);
        let fisher = block.full_fisher_block(&client).unwrap();
        assert_eq!(fisher.shape(), &[6, 6]);
    }

    #[test]
    fn test_conv_rejects_channels_first() {
        let (_client, device) = cpu_setup();
        let w = Tensor::<CpuRuntime>::zeros(&[3, 3, 2, 4], DType::F32, &device).unwrap();
        let err = ConvKFCBasicFB::new(
            &LayerParams::weights(w),
            Padding::Same,
            &[1, 1],
            None,
            DataFormat::ChannelsFirst,
            PatchExtractor::Convolution,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
