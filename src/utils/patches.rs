//! Convolution geometry and image patch extraction (im2col)
//!
//! # Layout contract
//!
//! ```text
//! input:   [N, H, W, C_in]            channels-last
//! filter:  [kh, kw, C_in, C_out]
//! patches: [N · out_h · out_w, kh · kw · C_in]   rows ordered (n, y, x)
//!                                                columns ordered (ky, kx, c)
//! ```
//!
//! Column order matches `filter.reshape([kh · kw · C_in, C_out])`, so a
//! patch row times the reshaped filter is one output pixel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Convolution padding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

impl FromStr for Padding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SAME" => Ok(Self::Same),
            "VALID" => Ok(Self::Valid),
            _ => Err(Error::InvalidArgument {
                arg: "padding",
                reason: format!("unknown padding '{s}', expected SAME or VALID"),
            }),
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Same => f.write_str("SAME"),
            Self::Valid => f.write_str("VALID"),
        }
    }
}

/// Memory layout of convolution activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataFormat {
    /// `[N, H, W, C]`
    #[default]
    ChannelsLast,
    /// `[N, C, H, W]`
    ChannelsFirst,
}

impl DataFormat {
    /// Reject anything but channels-last.
    pub fn require_channels_last(self) -> Result<()> {
        match self {
            Self::ChannelsLast => Ok(()),
            Self::ChannelsFirst => Err(Error::InvalidArgument {
                arg: "data_format",
                reason: "only channels-last layouts are supported".to_string(),
            }),
        }
    }
}

/// How a conv layer's patches are described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchExtractor {
    /// Strides and dilations given per spatial dimension (length 2), or in
    /// full 4-element form.
    #[default]
    Convolution,
    /// Strides and rates given in 4-element `[1, sy, sx, 1]` form.
    ImagePatches,
    /// 1×1 filters only.
    PointwiseConv2d,
}

impl PatchExtractor {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Convolution => "convolution",
            Self::ImagePatches => "extract_image_patches",
            Self::PointwiseConv2d => "extract_pointwise_conv2d_patches",
        }
    }
}

fn spatial_pair(arg: &'static str, values: &[usize], allow_short: bool) -> Result<[usize; 2]> {
    match values {
        [y, x] if allow_short => Ok([*y, *x]),
        [1, y, x, 1] => Ok([*y, *x]),
        _ => Err(Error::InvalidArgument {
            arg,
            reason: if allow_short {
                format!("expected 2 spatial values or [1, y, x, 1], got {values:?}")
            } else {
                format!("expected [1, y, x, 1], got {values:?}")
            },
        }),
    }
}

/// 2-D convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub padding: Padding,
}

impl ConvGeometry {
    /// Build from a `[kh, kw, C_in, C_out]` filter shape.
    pub fn new(
        filter_shape: &[usize],
        strides: &[usize],
        dilations: Option<&[usize]>,
        padding: Padding,
        extractor: PatchExtractor,
    ) -> Result<Self> {
        let &[kh, kw, _, _] = filter_shape else {
            return Err(Error::InvalidArgument {
                arg: "filter_shape",
                reason: format!("expected a 4-D filter, got shape {filter_shape:?}"),
            });
        };
        let allow_short = extractor != PatchExtractor::ImagePatches;
        let strides = spatial_pair("strides", strides, allow_short)?;
        let dilations = match dilations {
            Some(d) => spatial_pair("dilations", d, allow_short)?,
            None => [1, 1],
        };
        if strides.contains(&0) || dilations.contains(&0) {
            return Err(Error::InvalidArgument {
                arg: "strides",
                reason: "strides and dilations must be positive".to_string(),
            });
        }
        if extractor == PatchExtractor::PointwiseConv2d && (kh, kw) != (1, 1) {
            return Err(Error::InvalidArgument {
                arg: "filter_shape",
                reason: format!("pointwise patches need a 1x1 filter, got {kh}x{kw}"),
            });
        }
        Ok(Self {
            kernel: [kh, kw],
            strides,
            dilations,
            padding,
        })
    }

    fn effective_kernel(&self, axis: usize) -> usize {
        (self.kernel[axis] - 1) * self.dilations[axis] + 1
    }

    /// Output length and leading pad along one spatial axis.
    fn axis_extent(&self, axis: usize, input: usize) -> (usize, usize) {
        let stride = self.strides[axis];
        let k = self.effective_kernel(axis);
        match self.padding {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let needed = ((out.saturating_sub(1)) * stride + k).saturating_sub(input);
                (out, needed / 2)
            }
            Padding::Valid => {
                let out = if input >= k {
                    (input - k) / stride + 1
                } else {
                    0
                };
                (out, 0)
            }
        }
    }

    /// Output spatial size for an `[H, W]` input.
    pub fn output_size(&self, h: usize, w: usize) -> (usize, usize) {
        (self.axis_extent(0, h).0, self.axis_extent(1, w).0)
    }

    /// Extract patches from a row-major `[N, H, W, C]` buffer. Returns the
    /// patch matrix and its `(rows, cols)`; a trailing column of ones is
    /// appended when `append_ones` is set.
    pub(crate) fn extract(
        &self,
        data: &[f64],
        shape: &[usize],
        append_ones: bool,
    ) -> Result<(Vec<f64>, usize, usize)> {
        let &[n, h, w, c] = shape else {
            return Err(Error::InvalidArgument {
                arg: "inputs",
                reason: format!("expected [N, H, W, C] conv inputs, got shape {shape:?}"),
            });
        };
        let (out_h, pad_top) = self.axis_extent(0, h);
        let (out_w, pad_left) = self.axis_extent(1, w);
        let [kh, kw] = self.kernel;
        let cols = kh * kw * c + usize::from(append_ones);
        let rows = n * out_h * out_w;
        let mut patches = vec![0.0; rows * cols];

        let mut row = 0;
        for b in 0..n {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let base = row * cols;
                    for ky in 0..kh {
                        let iy = (oy * self.strides[0] + ky * self.dilations[0]) as isize
                            - pad_top as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * self.strides[1] + kx * self.dilations[1]) as isize
                                - pad_left as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let src = ((b * h + iy as usize) * w + ix as usize) * c;
                            let dst = base + (ky * kw + kx) * c;
                            patches[dst..dst + c].copy_from_slice(&data[src..src + c]);
                        }
                    }
                    if append_ones {
                        patches[base + cols - 1] = 1.0;
                    }
                    row += 1;
                }
            }
        }
        Ok((patches, rows, cols))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(kernel: usize, stride: usize, padding: Padding) -> ConvGeometry {
        ConvGeometry::new(
            &[kernel, kernel, 1, 1],
            &[stride, stride],
            None,
            padding,
            PatchExtractor::Convolution,
        )
        .unwrap()
    }

    #[test]
    fn test_output_sizes() {
        assert_eq!(geometry(3, 1, Padding::Same).output_size(5, 5), (5, 5));
        assert_eq!(geometry(3, 2, Padding::Same).output_size(5, 5), (3, 3));
        assert_eq!(geometry(3, 1, Padding::Valid).output_size(5, 5), (3, 3));
    }

    #[test]
    fn test_same_padding_zero_fills_border() {
        // 2x2 single-channel image, 3x3 kernel, SAME: corner patch sees the
        // image in its lower-right 2x2 window.
        let g = geometry(3, 1, Padding::Same);
        let (patches, rows, cols) = g.extract(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2, 1], false).unwrap();
        assert_eq!((rows, cols), (4, 9));
        assert_eq!(&patches[0..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_append_ones_column() {
        let g = geometry(1, 1, Padding::Valid);
        let (patches, rows, cols) = g.extract(&[5.0, 6.0], &[1, 1, 1, 2], true).unwrap();
        assert_eq!((rows, cols), (1, 3));
        assert_eq!(patches, vec![5.0, 6.0, 1.0]);
    }

    #[test]
    fn test_image_patches_needs_full_strides() {
        let err = ConvGeometry::new(
            &[3, 3, 1, 1],
            &[2, 2],
            None,
            Padding::Same,
            PatchExtractor::ImagePatches,
        );
        assert!(err.is_err());
        let ok = ConvGeometry::new(
            &[3, 3, 1, 1],
            &[1, 2, 2, 1],
            Some(&[1, 2, 2, 1]),
            Padding::Same,
            PatchExtractor::ImagePatches,
        )
        .unwrap();
        assert_eq!(ok.strides, [2, 2]);
        assert_eq!(ok.dilations, [2, 2]);
    }

    #[test]
    fn test_pointwise_rejects_wide_kernel() {
        let err = ConvGeometry::new(
            &[3, 3, 1, 1],
            &[1, 1],
            None,
            Padding::Same,
            PatchExtractor::PointwiseConv2d,
        );
        assert!(err.is_err());
    }
}
