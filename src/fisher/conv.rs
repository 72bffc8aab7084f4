//! Convolution helpers shared by the conv blocks

use crate::error::{Error, Result};

/// Number of spatial locations a conv filter is applied at:
/// `prod(input_shape[1..-1]) / prod(strides)`.
///
/// `input_shape` is channels-last (`[N, ..spatial.., C]`); `strides` may be
/// spatial-only or include unit batch/channel entries. `None` means unit
/// strides.
pub fn num_conv_locations(input_shape: &[usize], strides: Option<&[usize]>) -> usize {
    let spatial: usize = match input_shape {
        [_, spatial @ .., _] => spatial.iter().product(),
        _ => 1,
    };
    let stride: usize = strides.map_or(1, |s| s.iter().product());
    spatial / stride.max(1)
}

/// Require a `[1, y, x, 1]` style 4-element list.
pub(crate) fn require_len4(arg: &'static str, values: &[usize]) -> Result<()> {
    if values.len() != 4 {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("expected 4 elements, got {values:?}"),
        });
    }
    Ok(())
}

/// Require a `[kh, kw, C_in, C_out]` filter.
pub(crate) fn require_4d_filter(filter_shape: &[usize]) -> Result<()> {
    if filter_shape.len() != 4 {
        return Err(Error::InvalidArgument {
            arg: "params",
            reason: format!("expected a 4-D filter, got shape {filter_shape:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_1d() {
        assert_eq!(num_conv_locations(&[8, 10, 3], Some(&[2])), 5);
        assert_eq!(num_conv_locations(&[8, 9, 3], Some(&[2])), 4);
    }

    #[test]
    fn test_2d_with_full_strides() {
        assert_eq!(num_conv_locations(&[1, 8, 8, 3], Some(&[1, 2, 2, 1])), 16);
        assert_eq!(num_conv_locations(&[1, 8, 8, 3], None), 64);
    }

    #[test]
    fn test_length_checks() {
        assert!(require_len4("strides", &[1, 1, 1, 1]).is_ok());
        assert!(require_len4("strides", &[1, 1]).is_err());
        assert!(require_4d_filter(&[3, 3, 1]).is_err());
    }
}
