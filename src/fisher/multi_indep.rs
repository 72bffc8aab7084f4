//! Kronecker-factored blocks for layers used several times per tower
//!
//! These blocks assume the gradient contributions of different uses are
//! independent, so the block for `T` uses is `T · c · (A ⊗ G)` with factors
//! estimated over all uses together.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::debug;

use super::block::{already_instantiated, no_towers, FisherBlock};
use super::conv::num_conv_locations;
use super::kronecker::{core_of, reject_bias, KroneckerProductFB};
use super::towers::MultiUseTowers;
use crate::error::{Error, Result};
use crate::factors::{CovarianceFactor, FactorSpec, LayerCollection};
use crate::thunk::Damping;
use crate::utils::{ConvGeometry, DataFormat, LayerParams, Padding, PatchExtractor, Uses};
use crate::KfacClient;

/// Dense layer shared across uses (e.g. the time steps of an RNN).
pub struct FullyConnectedMultiIndepFB<R: Runtime> {
    has_bias: bool,
    towers: MultiUseTowers<R>,
    num_uses: Option<usize>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> FullyConnectedMultiIndepFB<R> {
    /// `num_uses` is only required when every tensor is registered folded.
    pub fn new(has_bias: bool, num_uses: Option<usize>) -> Self {
        Self {
            has_bias,
            towers: MultiUseTowers::new(num_uses),
            num_uses: None,
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

    /// Resolved number of uses, known once instantiated.
    pub fn num_uses(&self) -> Option<usize> {
        self.num_uses
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "FullyConnectedMultiIndepFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for FullyConnectedMultiIndepFB<R> {
    type Grads = [Vec<Uses<Tensor<R>>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Uses<Tensor<R>>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("FullyConnectedMultiIndepFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("FullyConnectedMultiIndepFB"));
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
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedMultiKronecker {
                tensors: data.grads,
                num_uses,
                has_bias: false,
            },
        )?;
        debug!(
            input = input.name(),
            output = output.name(),
            num_uses,
            "FullyConnectedMultiIndepFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config,
            input,
            output,
            damping,
            Some(num_uses),
            num_uses as f64,
        )?);
        self.num_uses = Some(num_uses);
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

/// 2-D convolution shared across uses, with the KFC approximation per use.
pub struct ConvKFCBasicMultiIndepFB<R: Runtime> {
    filter_shape: Vec<usize>,
    strides: Vec<usize>,
    geometry: ConvGeometry,
    has_bias: bool,
    towers: MultiUseTowers<R>,
    explicit_locations: Option<usize>,
    num_locations: Option<usize>,
    num_uses: Option<usize>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> ConvKFCBasicMultiIndepFB<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &LayerParams<R>,
        padding: Padding,
        strides: &[usize],
        dilations: Option<&[usize]>,
        data_format: DataFormat,
        extractor: PatchExtractor,
        num_uses: Option<usize>,
    ) -> Result<Self> {
        data_format.require_channels_last()?;
        let filter_shape = params.weight_shape()?.to_vec();
        let geometry = ConvGeometry::new(&filter_shape, strides, dilations, padding, extractor)?;
        Ok(Self {
            filter_shape,
            strides: strides.to_vec(),
            geometry,
            has_bias: params.has_bias(),
            towers: MultiUseTowers::new(num_uses),
            explicit_locations: None,
            num_locations: None,
            num_uses: None,
            core: None,
        })
    }

    /// Fix the spatial locations per use instead of reading them from the
    /// first registered input.
    pub fn with_num_locations(mut self, num_locations: usize) -> Self {
        self.explicit_locations = Some(num_locations);
        self
    }

    pub fn register_additional_tower(
        &mut self,
        inputs: &Uses<Tensor<R>>,
        outputs: &Uses<Tensor<R>>,
    ) {
        self.towers.register(inputs, outputs);
    }

    pub fn filter_shape(&self) -> &[usize] {
        &self.filter_shape
    }

    /// Spatial locations per use, known once instantiated.
    pub fn num_locations(&self) -> Option<usize> {
        self.num_locations
    }

    pub fn num_uses(&self) -> Option<usize> {
        self.num_uses
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "ConvKFCBasicMultiIndepFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for ConvKFCBasicMultiIndepFB<R> {
    type Grads = [Vec<Uses<Tensor<R>>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Uses<Tensor<R>>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("ConvKFCBasicMultiIndepFB"));
        }
        // Only the spatial dims matter, and folding uses into the batch
        // leaves them alone.
        let input_shape = self
            .towers
            .first_input_shape()
            .ok_or_else(|| no_towers("ConvKFCBasicMultiIndepFB"))?;
        let num_locations = match self.explicit_locations {
            Some(0) => {
                return Err(Error::InvalidArgument {
                    arg: "num_locations",
                    reason: "must be positive".to_string(),
                })
            }
            Some(n) => n,
            None => num_conv_locations(input_shape, Some(&self.strides)),
        };

        let config = *collection.config();
        let (data, num_uses) = self.towers.canonicalize(config.tower_strategy, grads_list)?;
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
        let replications = num_locations * num_uses;
        debug!(
            input = input.name(),
            output = output.name(),
            num_locations,
            num_uses,
            "ConvKFCBasicMultiIndepFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config,
            input,
            output,
            damping,
            Some(replications),
            replications as f64,
        )?);
        self.num_locations = Some(num_locations);
        self.num_uses = Some(num_uses);
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

/// Embedding lookup shared across uses. Bias is not supported.
pub struct EmbeddingKFACMultiIndepFB<R: Runtime> {
    vocab_size: usize,
    towers: MultiUseTowers<R>,
    num_uses: Option<usize>,
    core: Option<KroneckerProductFB<R>>,
}

impl<R: Runtime<DType = DType>> EmbeddingKFACMultiIndepFB<R> {
    pub fn new(vocab_size: usize, num_uses: Option<usize>) -> Self {
        Self {
            vocab_size,
            towers: MultiUseTowers::new(num_uses),
            num_uses: None,
            core: None,
        }
    }

    pub fn register_additional_tower(&mut self, ids: &Uses<Tensor<R>>, outputs: &Uses<Tensor<R>>) {
        self.towers.register(ids, outputs);
    }

    pub fn num_uses(&self) -> Option<usize> {
        self.num_uses
    }

    pub fn kronecker(&self) -> Result<&KroneckerProductFB<R>> {
        core_of(&self.core, "EmbeddingKFACMultiIndepFB")
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.kronecker()?.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for EmbeddingKFACMultiIndepFB<R> {
    type Grads = [Vec<Uses<Tensor<R>>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Uses<Tensor<R>>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.core.is_some() {
            return Err(already_instantiated("EmbeddingKFACMultiIndepFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("EmbeddingKFACMultiIndepFB"));
        }
        let config = *collection.config();
        let (data, num_uses) = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let input = collection.make_or_get_kronecker(
            client,
            FactorSpec::EmbeddingInputKronecker {
                inputs: data.inputs,
                vocab_size: self.vocab_size,
            },
        )?;
        let output = collection.make_or_get_kronecker(
            client,
            FactorSpec::FullyConnectedMultiKronecker {
                tensors: data.grads,
                num_uses,
                has_bias: false,
            },
        )?;
        debug!(
            input = input.name(),
            output = output.name(),
            num_uses,
            "EmbeddingKFACMultiIndepFB instantiated"
        );
        self.core = Some(KroneckerProductFB::new(
            &config,
            input,
            output,
            damping,
            Some(num_uses),
            num_uses as f64,
        )?);
        self.num_uses = Some(num_uses);
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
        reject_bias(vector, "EmbeddingKFACMultiIndepFB")?;
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
    use crate::config::KfacConfig;
    use crate::error::Error;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
    use numr::runtime::RuntimeClient;

    fn mat(rows: usize, cols: usize, seed: f32, device: &CpuDevice) -> Tensor<CpuRuntime> {
        let data: Vec<f32> = (0..rows * cols)
            .map(|i| ((i as f32 + 1.0) * seed).sin())
            .collect();
        Tensor::<CpuRuntime>::from_slice(&data, &[rows, cols], device).unwrap()
    }

    #[test]
    fn test_fully_connected_renorm_is_num_uses() {
        let (client, device) = cpu_setup();
        let inputs = Uses::PerUse(vec![mat(3, 2, 0.3, &device), mat(3, 2, 0.7, &device)]);
        let outputs = Uses::PerUse(vec![mat(3, 4, 1.1, &device), mat(3, 4, 0.2, &device)]);
        let mut block = FullyConnectedMultiIndepFB::new(true, None);
        block.register_additional_tower(&inputs, &outputs);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![outputs.clone()]],
                &Damping::Constant(0.1),
            )
            .unwrap();
        assert_eq!(block.num_uses(), Some(2));
        let core = block.kronecker().unwrap();
        assert_eq!(core.renorm_coeff(), 2.0);
        assert_eq!(core.input_factor().dim(), 3);
        assert_eq!(core.output_factor().dim(), 4);
    }

    #[test]
    fn test_folded_without_num_uses_fails() {
        let (client, device) = cpu_setup();
        let inputs = Uses::Folded(mat(4, 2, 0.3, &device));
        let outputs = Uses::Folded(mat(4, 3, 0.9, &device));
        let mut block = FullyConnectedMultiIndepFB::new(false, None);
        block.register_additional_tower(&inputs, &outputs);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        let err = block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![outputs.clone()]],
                &Damping::Constant(0.1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UseCount { .. }));
    }

    fn conv_block(
        client: &CpuClient,
        inputs: Uses<Tensor<CpuRuntime>>,
        outputs: Uses<Tensor<CpuRuntime>>,
        num_uses: Option<usize>,
        num_locations: Option<usize>,
    ) -> Result<ConvKFCBasicMultiIndepFB<CpuRuntime>> {
        let w = Tensor::<CpuRuntime>::zeros(&[1, 1, 1, 2], DType::F32, client.device()).unwrap();
        let mut block = ConvKFCBasicMultiIndepFB::new(
            &LayerParams::weights(w),
            Padding::Same,
            &[1, 1],
            None,
            DataFormat::ChannelsLast,
            PatchExtractor::Convolution,
            num_uses,
        )?;
        if let Some(n) = num_locations {
            block = block.with_num_locations(n);
        }
        block.register_additional_tower(&inputs, &outputs);
        let mut collection = LayerCollection::new(KfacConfig::default())?;
        block.instantiate_factors(
            client,
            &mut collection,
            &[vec![outputs]],
            &Damping::Constant(0.1),
        )?;
        Ok(block)
    }

    fn conv_data() -> (Vec<f32>, Vec<f32>) {
        let x_data: Vec<f32> = (0..16).map(|i| (i as f32 * 0.3).cos()).collect();
        let y_data: Vec<f32> = (0..32).map(|i| (i as f32 * 0.2).sin()).collect();
        (x_data, y_data)
    }

    #[test]
    fn test_conv_locations_match_for_folded_and_per_use() {
        let (client, device) = cpu_setup();
        let (x_data, y_data) = conv_data();
        let slice = |data: &[f32], k: usize, shape: &[usize]| {
            let n: usize = shape.iter().product();
            Tensor::<CpuRuntime>::from_slice(&data[k * n..(k + 1) * n], shape, &device).unwrap()
        };
        let summary = |block: ConvKFCBasicMultiIndepFB<CpuRuntime>| {
            (block.num_locations(), block.kronecker().unwrap().renorm_coeff())
        };

        let per_use = conv_block(
            &client,
            Uses::PerUse(vec![slice(&x_data, 0, &[2, 2, 2, 1]), slice(&x_data, 1, &[2, 2, 2, 1])]),
            Uses::PerUse(vec![slice(&y_data, 0, &[2, 2, 2, 2]), slice(&y_data, 1, &[2, 2, 2, 2])]),
            None,
            None,
        )
        .unwrap();
        let folded = conv_block(
            &client,
            Uses::Folded(slice(&x_data, 0, &[4, 2, 2, 1])),
            Uses::Folded(slice(&y_data, 0, &[4, 2, 2, 2])),
            Some(2),
            None,
        )
        .unwrap();
        let per_use = summary(per_use);
        assert_eq!(per_use, (Some(4), 8.0));
        assert_eq!(per_use, summary(folded));
    }

    #[test]
    fn test_conv_explicit_locations_override_input_shape() {
        let (client, device) = cpu_setup();
        let (x_data, y_data) = conv_data();
        let x = Tensor::<CpuRuntime>::from_slice(&x_data, &[4, 2, 2, 1], &device).unwrap();
        let y = Tensor::<CpuRuntime>::from_slice(&y_data, &[4, 2, 2, 2], &device).unwrap();

        let block = conv_block(
            &client,
            Uses::Folded(x.clone()),
            Uses::Folded(y.clone()),
            Some(2),
            Some(3),
        )
        .unwrap();
        assert_eq!(block.num_locations(), Some(3));
        assert_eq!(block.kronecker().unwrap().renorm_coeff(), 6.0);

        let err = conv_block(&client, Uses::Folded(x), Uses::Folded(y), Some(2), Some(0))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument { arg: "num_locations", .. }));
    }

    #[test]
    fn test_embedding_multi_uses_diagonal_input() {
        let (client, device) = cpu_setup();
        let ids = Uses::PerUse(vec![
            Tensor::<CpuRuntime>::from_slice(&[0i64, 1], &[2], &device).unwrap(),
            Tensor::<CpuRuntime>::from_slice(&[2i64, 2], &[2], &device).unwrap(),
        ]);
        let outputs = Uses::PerUse(vec![mat(2, 3, 0.4, &device), mat(2, 3, 0.8, &device)]);
        let mut block = EmbeddingKFACMultiIndepFB::new(3, None);
        block.register_additional_tower(&ids, &outputs);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![outputs.clone()]],
                &Damping::Constant(0.1),
            )
            .unwrap();
        let core = block.kronecker().unwrap();
        assert!(core.input_factor().is_diagonal());
        assert_eq!(core.renorm_coeff(), 2.0);
        assert_eq!(block.full_fisher_block(&client).unwrap().shape(), &[9, 9]);
    }
}
