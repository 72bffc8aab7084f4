//! Depthwise convolutions as conv blocks over a block-diagonal filter
//!
//! A depthwise filter `[kh, kw, C_in, M]` is the conv2d filter
//! `[kh, kw, C_in, C_in·M]` whose off-diagonal channel blocks are zero. The
//! blocks here build their factors for that conv2d filter and convert vectors
//! on the way in and out.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::block::FisherBlock;
use super::conv::{require_4d_filter, require_len4};
use super::diagonal::ConvDiagonalFB;
use super::kronecker::{reject_bias, ConvKFCBasicFB};
use crate::error::{Error, Result};
use crate::factors::LayerCollection;
use crate::thunk::Damping;
use crate::utils::{DataFormat, LayerParams, Padding, PatchExtractor};
use crate::KfacClient;

fn filter_dims(arg: &'static str, shape: &[usize]) -> Result<[usize; 4]> {
    match shape {
        &[h, w, a, b] => Ok([h, w, a, b]),
        _ => Err(Error::InvalidArgument {
            arg,
            reason: format!("expected a 4-D filter, got shape {shape:?}"),
        }),
    }
}

/// `[kh, kw, C_in, M]` → `[kh, kw, C_in, C_in·M]`, zero outside the
/// per-channel diagonal blocks.
pub fn depthwise_conv2d_filter_to_conv2d_filter<R, C>(
    client: &C,
    filter: &Tensor<R>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let [h, w, in_channels, multiplier] = filter_dims("filter", filter.shape())?;
    let zeros =
        |n: usize| Tensor::<R>::zeros(&[h, w, n, multiplier], filter.dtype(), filter.device());

    let mut out_blocks = Vec::with_capacity(in_channels);
    for i in 0..in_channels {
        let mut parts = Vec::with_capacity(3);
        if i > 0 {
            parts.push(zeros(i)?);
        }
        parts.push(filter.narrow(2, i, 1)?);
        if i + 1 < in_channels {
            parts.push(zeros(in_channels - i - 1)?);
        }
        let refs: Vec<&Tensor<R>> = parts.iter().collect();
        out_blocks.push(client.cat(&refs, -2)?);
    }
    let refs: Vec<&Tensor<R>> = out_blocks.iter().collect();
    Ok(client.cat(&refs, -1)?)
}

/// `[kh, kw, C_in, C_out]` → `[kh, kw, C_in, C_out / C_in]`, keeping only the
/// diagonal channel blocks.
pub fn conv2d_filter_to_depthwise_conv2d_filter<R, C>(
    client: &C,
    filter: &Tensor<R>,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
{
    let [h, w, in_channels, out_channels] = filter_dims("filter", filter.shape())?;
    if in_channels == 0 || out_channels % in_channels != 0 {
        return Err(Error::InvalidArgument {
            arg: "filter",
            reason: format!(
                "out_channels ({out_channels}) must be a multiple of in_channels ({in_channels})"
            ),
        });
    }
    let multiplier = out_channels / in_channels;
    let blocks = filter
        .contiguous()?
        .reshape(&[h, w, in_channels, in_channels, multiplier])?;

    let slices = (0..in_channels)
        .map(|i| -> Result<Tensor<R>> {
            Ok(blocks
                .narrow(2, i, 1)?
                .narrow(3, i, 1)?
                .contiguous()?
                .reshape(&[h, w, 1, multiplier])?)
        })
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor<R>> = slices.iter().collect();
    Ok(client.cat(&refs, -2)?)
}

/// Validated depthwise arguments: the equivalent conv2d filter shape and the
/// 4-element dilation rate.
struct DepthwiseArgs {
    conv2d_filter_shape: Vec<usize>,
    dilations: Option<Vec<usize>>,
}

impl DepthwiseArgs {
    fn new<R: Runtime<DType = DType>>(
        block: &str,
        params: &LayerParams<R>,
        strides: &[usize],
        rate: Option<&[usize]>,
        data_format: DataFormat,
    ) -> Result<Self> {
        if params.has_bias() {
            return Err(Error::Unsupported {
                feature: format!("bias parameters in {block}"),
            });
        }
        let shape = params.weight_shape()?;
        require_4d_filter(shape)?;
        require_len4("strides", strides)?;
        let dilations = match rate {
            None => None,
            Some(&[ry, rx]) => Some(vec![1, ry, rx, 1]),
            Some(other) => {
                return Err(Error::InvalidArgument {
                    arg: "rate",
                    reason: format!("rate must only cover the 2 spatial dimensions, got {other:?}"),
                })
            }
        };
        data_format.require_channels_last()?;
        let [h, w, in_channels, multiplier] = filter_dims("params", shape)?;
        Ok(Self {
            conv2d_filter_shape: vec![h, w, in_channels, in_channels * multiplier],
            dilations,
        })
    }
}

fn weights<R: Runtime<DType = DType>>(params: &LayerParams<R>) -> Result<&Tensor<R>> {
    params.tensors().first().ok_or_else(|| Error::InvalidArgument {
        arg: "vector",
        reason: "no filter tensor".to_string(),
    })
}

fn via_conv2d<R, C, F>(
    client: &C,
    vector: &LayerParams<R>,
    block: &'static str,
    f: F,
) -> Result<LayerParams<R>>
where
    R: Runtime<DType = DType>,
    C: KfacClient<R>,
    F: FnOnce(&LayerParams<R>) -> Result<LayerParams<R>>,
{
    reject_bias(vector, block)?;
    let conv2d = LayerParams::weights(depthwise_conv2d_filter_to_conv2d_filter(
        client,
        weights(vector)?,
    )?);
    let out = f(&conv2d)?;
    Ok(LayerParams::weights(conv2d_filter_to_depthwise_conv2d_filter(
        client,
        weights(&out)?,
    )?))
}

/// [`ConvDiagonalFB`] applied to each input channel of a depthwise conv in
/// isolation.
pub struct DepthwiseConvDiagonalFB<R: Runtime> {
    inner: ConvDiagonalFB<R>,
}

impl<R: Runtime<DType = DType>> DepthwiseConvDiagonalFB<R> {
    /// `params` is the `[kh, kw, C_in, M]` filter; `strides` is
    /// `[1, sy, sx, 1]` and `rate` the spatial `[ry, rx]` dilation.
    pub fn new(
        params: &LayerParams<R>,
        strides: &[usize],
        padding: Padding,
        rate: Option<&[usize]>,
        data_format: DataFormat,
    ) -> Result<Self> {
        let args =
            DepthwiseArgs::new("DepthwiseConvDiagonalFB", params, strides, rate, data_format)?;
        let inner = ConvDiagonalFB::with_filter_shape(
            args.conv2d_filter_shape,
            false,
            strides,
            padding,
            args.dilations.as_deref(),
            data_format,
        )?;
        Ok(Self { inner })
    }

    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.inner.register_additional_tower(inputs, outputs);
    }

    /// Shape of the equivalent conv2d filter.
    pub fn filter_shape(&self) -> &[usize] {
        self.inner.filter_shape()
    }

    pub fn conv(&self) -> &ConvDiagonalFB<R> {
        &self.inner
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for DepthwiseConvDiagonalFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        self.inner
            .instantiate_factors(client, collection, grads_list, damping)
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        self.inner.register_matpower(exp)
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        via_conv2d(client, vector, "DepthwiseConvDiagonalFB", |v| {
            self.inner.multiply_matpower(client, v, exp)
        })
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.inner.tensors_to_compute_grads()
    }

    fn num_registered_towers(&self) -> usize {
        self.inner.num_registered_towers()
    }
}

/// [`ConvKFCBasicFB`] applied to each input channel of a depthwise conv in
/// isolation.
pub struct DepthwiseConvKFCBasicFB<R: Runtime> {
    inner: ConvKFCBasicFB<R>,
}

impl<R: Runtime<DType = DType>> DepthwiseConvKFCBasicFB<R> {
    /// `params` is the `[kh, kw, C_in, M]` filter; `strides` is
    /// `[1, sy, sx, 1]` and `rate` the spatial `[ry, rx]` dilation.
    pub fn new(
        params: &LayerParams<R>,
        strides: &[usize],
        padding: Padding,
        rate: Option<&[usize]>,
        data_format: DataFormat,
    ) -> Result<Self> {
        let args =
            DepthwiseArgs::new("DepthwiseConvKFCBasicFB", params, strides, rate, data_format)?;
        let inner = ConvKFCBasicFB::with_filter_shape(
            args.conv2d_filter_shape,
            false,
            padding,
            strides,
            args.dilations.as_deref(),
            data_format,
            PatchExtractor::ImagePatches,
        )?;
        Ok(Self { inner })
    }

    pub fn register_additional_tower(&mut self, inputs: &Tensor<R>, outputs: &Tensor<R>) {
        self.inner.register_additional_tower(inputs, outputs);
    }

    /// Shape of the equivalent conv2d filter.
    pub fn filter_shape(&self) -> &[usize] {
        self.inner.filter_shape()
    }

    pub fn conv(&self) -> &ConvKFCBasicFB<R> {
        &self.inner
    }

    pub fn full_fisher_block<C: KfacClient<R>>(&self, client: &C) -> Result<Tensor<R>> {
        self.inner.full_fisher_block(client)
    }
}

impl<R: Runtime<DType = DType>> FisherBlock<R> for DepthwiseConvKFCBasicFB<R> {
    type Grads = [Vec<Tensor<R>>];

    fn instantiate_factors<C: KfacClient<R>>(
        &mut self,
        client: &C,
        collection: &mut LayerCollection<R>,
        grads_list: &[Vec<Tensor<R>>],
        damping: &Damping,
    ) -> Result<()> {
        self.inner
            .instantiate_factors(client, collection, grads_list, damping)
    }

    fn register_matpower(&self, exp: f64) -> Result<()> {
        self.inner.register_matpower(exp)
    }

    fn multiply_matpower<C: KfacClient<R>>(
        &self,
        client: &C,
        vector: &LayerParams<R>,
        exp: f64,
    ) -> Result<LayerParams<R>> {
        via_conv2d(client, vector, "DepthwiseConvKFCBasicFB", |v| {
            self.inner.multiply_matpower(client, v, exp)
        })
    }

    fn tensors_to_compute_grads(&self) -> Vec<&Tensor<R>> {
        self.inner.tensors_to_compute_grads()
    }

    fn num_registered_towers(&self) -> usize {
        self.inner.num_registered_towers()
    }
}
