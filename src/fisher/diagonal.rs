//! Sum-of-squares diagonal blocks for dense and conv layers

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::debug;

use super::block::{already_instantiated, no_towers, not_instantiated, FisherBlock};
use super::conv::{num_conv_locations, require_4d_filter, require_len4};
use super::towers::InputOutputTowers;
use crate::config::KfacConfig;
use crate::damping::normalize_damping;
use crate::error::Result;
use crate::factors::{CovarianceFactor, DiagonalFactor, FactorSpec, LayerCollection};
use crate::thunk::{Damping, DampingFunc, FuncId, PackagedFunc};
use crate::utils::{
    layer_params_to_mat2d, mat2d_to_layer_params, ConvGeometry, DataFormat, LayerParams, Padding,
    PatchExtractor,
};
use crate::KfacClient;

fn multiply_diagonal<R, C>(
    client: &C,
    factor: &DiagonalFactor<R>,
    damping: &DampingFunc,
    vector: &LayerParams<R>,
    exp: f64,
) -> Result<LayerParams<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let mat = layer_params_to_mat2d(client, vector)?;
    let out = factor.multiply_matpower(client, &mat, exp, damping)?;
    mat2d_to_layer_params(vector, &out)
}

/// Diagonal block for dense layers using the per-example
/// sum-of-squares estimator.
pub struct FullyConnectedDiagonalFB<R: Runtime> {
    has_bias: bool,
    towers: InputOutputTowers<R>,
    factor: Option<(Arc<DiagonalFactor<R>>, DampingFunc)>,
}

impl<R: Runtime<DType = DType>> FullyConnectedDiagonalFB<R> {
    pub fn new(has_bias: bool) -> Self {
        Self {
            has_bias,
            towers: InputOutputTowers::default(),
            factor: None,
        }
    }

    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.towers.register(inputs, outputs);
    }

    /// The undamped diagonal, `[in(+1), out]`.
    pub fn diagonal(&self) -> Result<&Tensor<R>> {
        self.factor
            .as_ref()
            .map(|(f, _)| f.get_cov())
            .ok_or_else(|| not_instantiated("FullyConnectedDiagonalFB"))
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for FullyConnectedDiagonalFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.factor.is_some() {
            return Err(already_instantiated("FullyConnectedDiagonalFB"));
        }
        if self.towers.num_towers() == 0 {
            return Err(no_towers("FullyConnectedDiagonalFB"));
        }
        let data = self
            .towers
            .canonicalize(collection.config().tower_strategy, grads_list)?;
        let factor = collection.make_or_get_diagonal(
            client,
            FactorSpec::FullyConnectedDiagonal {
                inputs: data.inputs,
                grads: data.grads,
                has_bias: self.has_bias,
            },
        )?;
        debug!(factor = factor.name(), "FullyConnectedDiagonalFB instantiated");
        self.factor = Some((factor, damping.to_func()));
        Ok(())
    }

    fn register_matpower(&self, _exp: f64) -> Result<()> {
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        let (factor, damping) = self
            .factor
            .as_ref()
            .ok_or_else(|| not_instantiated("FullyConnectedDiagonalFB"))?;
        multiply_diagonal(client, factor, damping, vector, exp)
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.towers.outputs()
    }

    fn num_registered_towers(&self) -> usize {
        self.towers.num_towers()
    }
}

/// Diagonal block for 2-D convolutions. Each example's gradient is the sum
/// over locations of `patch ⊗ output_grad`; the block is the mean of its
/// elementwise square.
pub struct ConvDiagonalFB<R: Runtime> {
    filter_shape: Vec<usize>,
    strides: Vec<usize>,
    geometry: ConvGeometry,
    has_bias: bool,
    towers: InputOutputTowers<R>,
    num_locations: Option<usize>,
    factor: Option<(Arc<DiagonalFactor<R>>, DampingFunc)>,
}

impl<R: Runtime<DType = DType>> ConvDiagonalFB<R> {
    /// `strides` and `dilations` are `[1, sy, sx, 1]`.
    pub fn new(
        params: &LayerParams<R>,
        strides: &[usize],
        padding: Padding,
        dilations: Option<&[usize]>,
        data_format: DataFormat,
    ) -> Result<Self> {
        let filter_shape = params.weight_shape()?.to_vec();
        Self::with_filter_shape(
            filter_shape,
            params.has_bias(),
            strides,
            padding,
            dilations,
            data_format,
        )
    }

    pub(crate) fn with_filter_shape(
        filter_shape: Vec<usize>,
        has_bias: bool,
        strides: &[usize],
        padding: Padding,
        dilations: Option<&[usize]>,
        data_format: DataFormat,
    ) -> Result<Self> {
        require_len4("strides", strides)?;
        if let Some(d) = dilations {
            require_len4("dilations", d)?;
        }
        data_format.require_channels_last()?;
        require_4d_filter(&filter_shape)?;
        let geometry = ConvGeometry::new(
            &filter_shape,
            strides,
            dilations,
            padding,
            PatchExtractor::Convolution,
        )?;
        Ok(Self {
            filter_shape,
            strides: strides.to_vec(),
            geometry,
            has_bias,
            towers: InputOutputTowers::default(),
            num_locations: None,
            factor: None,
        })
    }

    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.towers.register(inputs, outputs);
    }

    pub fn filter_shape(&self) -> &[usize] {
        &self.filter_shape
    }

    pub fn num_locations(&self) -> Option<usize> {
        self.num_locations
    }

    /// Damping used by the factor: `n · normalize_damping(damping, n)` for
    /// `n` conv locations.
    pub fn damping_func(&self) -> Result<&DampingFunc> {
        self.factor
            .as_ref()
            .map(|(_, d)| d)
            .ok_or_else(|| not_instantiated("ConvDiagonalFB"))
    }

    /// The undamped diagonal, `[kh·kw·C_in(+1), C_out]`.
    pub fn diagonal(&self) -> Result<&Tensor<R>> {
        self.factor
            .as_ref()
            .map(|(f, _)| f.get_cov())
            .ok_or_else(|| not_instantiated("ConvDiagonalFB"))
    }
}

fn location_scaled_damping(
    config: &KfacConfig,
    damping: &Damping,
    num_locations: usize,
) -> DampingFunc {
    let config = *config;
    let value = damping.clone();
    PackagedFunc::new(
        move || {
            let n = num_locations as f64;
            Ok(n * normalize_damping(&config, value.value(), n))
        },
        FuncId::new()
            .with(num_locations)
            .with("mult")
            .with("normalize_damping")
            .with(damping.id_elem())
            .with(num_locations),
    )
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for ConvDiagonalFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        if self.factor.is_some() {
            return Err(already_instantiated("ConvDiagonalFB"));
        }
        let config = *collection.config();
        let data = self.towers.canonicalize(config.tower_strategy, grads_list)?;
        let num_locations = match data.inputs.first() {
            Some(first) => num_conv_locations(&first.shape(), Some(&self.strides)),
            None => return Err(no_towers("ConvDiagonalFB")),
        };
        let factor = collection.make_or_get_diagonal(
            client,
            FactorSpec::ConvDiagonal {
                inputs: data.inputs,
                grads: data.grads,
                geometry: self.geometry,
                has_bias: self.has_bias,
            },
        )?;
        debug!(factor = factor.name(), num_locations, "ConvDiagonalFB instantiated");
        self.num_locations = Some(num_locations);
        self.factor = Some((
            factor,
            location_scaled_damping(&config, damping, num_locations),
        ));
        Ok(())
    }

    fn register_matpower(&self, _exp: f64) -> Result<()> {
        Ok(())
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        let (factor, damping) = self
            .factor
            .as_ref()
            .ok_or_else(|| not_instantiated("ConvDiagonalFB"))?;
        multiply_diagonal(client, factor, damping, vector, exp)
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
    use crate::error::Error;
    use crate::test_utils::cpu_setup;
    use crate::thunk::IdAtom;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_fully_connected_diagonal_values() {
        let (client, device) = cpu_setup();
        // two examples, one input, one output
        let x = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2, 1], &device).unwrap();
        let y = Tensor::<CpuRuntime>::from_slice(&[3.0f32, -1.0], &[2, 1], &device).unwrap();
        let mut block = FullyConnectedDiagonalFB::new(false);
        block.register_additional_tower(&x, &y);
        let mut collection = LayerCollection::new(KfacConfig::default()).unwrap();
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![y.clone()]],
                &Damping::Constant(0.5),
            )
            .unwrap();
        // mean of (x·g)² = (9 + 4) / 2
        let diag = block.diagonal().unwrap().to_vec::<f32>();
        assert!((diag[0] - 6.5).abs() < 1e-5);

        let v = LayerParams::weights(
            Tensor::<CpuRuntime>::from_slice(&[14.0f32], &[1, 1], &device).unwrap(),
        );
        let out = block.multiply_inverse(&client, &v).unwrap();
        assert!((out.tensors()[0].to_vec::<f32>()[0] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_conv_diagonal_validation() {
        let (_client, device) = cpu_setup();
        let w = LayerParams::weights(
            Tensor::<CpuRuntime>::zeros(&[3, 3, 2, 4], DType::F32, &device).unwrap(),
        );
        let ok =
            ConvDiagonalFB::new(&w, &[1, 1, 1, 1], Padding::Same, None, DataFormat::ChannelsLast);
        assert!(ok.is_ok());

        let bad_strides =
            ConvDiagonalFB::new(&w, &[1, 1], Padding::Same, None, DataFormat::ChannelsLast);
        assert!(matches!(bad_strides.err(), Some(Error::InvalidArgument { .. })));

        let bad_dilations = ConvDiagonalFB::new(
            &w,
            &[1, 1, 1, 1],
            Padding::Same,
            Some(&[2, 2]),
            DataFormat::ChannelsLast,
        );
        assert!(bad_dilations.is_err());

        let channels_first =
            ConvDiagonalFB::new(&w, &[1, 1, 1, 1], Padding::Same, None, DataFormat::ChannelsFirst);
        assert!(channels_first.is_err());

        let flat = LayerParams::weights(
            Tensor::<CpuRuntime>::zeros(&[9, 4], DType::F32, &device).unwrap(),
        );
        let not_4d = ConvDiagonalFB::new(
            &flat,
            &[1, 1, 1, 1],
            Padding::Same,
            None,
            DataFormat::ChannelsLast,
        );
        assert!(not_4d.is_err());
    }

    #[test]
    fn test_conv_diagonal_damping() {
        let (client, device) = cpu_setup();
        let w = LayerParams::weights(
            Tensor::<CpuRuntime>::zeros(&[1, 1, 1, 1], DType::F32, &device).unwrap(),
        );
        let mut block =
            ConvDiagonalFB::new(&w, &[1, 2, 2, 1], Padding::Valid, None, DataFormat::ChannelsLast)
                .unwrap();
        let x_data: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let x = Tensor::<CpuRuntime>::from_slice(&x_data, &[1, 4, 4, 1], &device).unwrap();
        let y = Tensor::<CpuRuntime>::from_slice(
            &[0.5f32, -0.5, 1.0, 0.25],
            &[1, 2, 2, 1],
            &device,
        )
        .unwrap();
        block.register_additional_tower(&x, &y);

        let config = KfacConfig::default().with_normalize_damping_power(0.5);
        let mut collection = LayerCollection::new(config).unwrap();
        block
            .instantiate_factors(
                &client,
                &mut collection,
                &[vec![y.clone()]],
                &Damping::Constant(0.2),
            )
            .unwrap();
        assert_eq!(block.num_locations(), Some(4));

        // 4 · 0.2 / 4^0.5
        let damping = block.damping_func().unwrap();
        assert!((damping.call().unwrap() - 0.4).abs() < 1e-12);
        let id = damping.func_id();
        assert_eq!(id.atoms()[0], IdAtom::Int(4));
        assert_eq!(id.atoms()[1], IdAtom::Str("mult".to_string()));
        assert_eq!(id.atoms().len(), 5);
    }
}
