//! Control image preprocessing.

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;

use crate::config::ResizeMode;
use crate::error::{Error, Result};

use super::{ControlTensor, RGB_CHANNELS};

/// Latent downsampling factor of the VAE.
const LATENT_FACTOR: u32 = 8;

/// Turn an input image into a control tensor.
///
/// The image is:
/// 1. Converted to 3-channel RGB
/// 2. Resized according to `mode` (see [`ResizeMode::target_dimensions`])
/// 3. Normalized to [0, 1] range
/// 4. Returned as NCHW tensor (1, 3, height, width)
///
/// # Errors
///
/// Returns an error if the resulting dimensions are not multiples of 8.
pub fn prepare_control(
    img: &DynamicImage,
    mode: ResizeMode,
    resolution: u32,
) -> Result<ControlTensor> {
    let (width, height) = img.dimensions();
    let (target_w, target_h) = mode.target_dimensions(width, height, resolution);

    if target_w % LATENT_FACTOR != 0 || target_h % LATENT_FACTOR != 0 {
        return Err(Error::UnsupportedDimensions {
            width: target_w,
            height: target_h,
            reason: format!("both sides must be multiples of {LATENT_FACTOR}"),
        });
    }

    let rgb = img.to_rgb8();
    let rgb = if (target_w, target_h) == (width, height) {
        rgb
    } else {
        image::imageops::resize(&rgb, target_w, target_h, FilterType::Lanczos3)
    };

    tracing::debug!("Control image {width}x{height} -> {target_w}x{target_h} ({mode:?})");

    Ok(rgb_to_tensor(&rgb))
}

/// Convert an RGB image to a [0, 1] NCHW tensor.
fn rgb_to_tensor(rgb: &RgbImage) -> ControlTensor {
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            tensor[[0, c, y, x]] = f32::from(pixel[c]) / 255.0;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, LumaA, Rgb};

    #[test]
    fn test_exact_resize_shape_for_non_square_input() {
        let img = DynamicImage::new_rgb8(300, 200);
        let tensor = prepare_control(&img, ResizeMode::Exact, 512).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 512, 512]);
    }

    #[test]
    fn test_preserve_aspect_shape() {
        let img = DynamicImage::new_rgb8(300, 200);
        let tensor = prepare_control(&img, ResizeMode::PreserveAspect, 512).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 512, 768]);
    }

    #[test]
    fn test_black_image_is_all_zero() {
        let img = DynamicImage::new_rgb8(64, 64);
        let tensor = prepare_control(&img, ResizeMode::None, 512).unwrap();

        assert!(tensor.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_values_in_unit_range() {
        let mut rgb = RgbImage::new(16, 16);
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 16) as u8, (y * 16) as u8, 255]);
        }
        let tensor = prepare_control(&DynamicImage::ImageRgb8(rgb), ResizeMode::Exact, 64).unwrap();

        let min = tensor.iter().copied().fold(f32::INFINITY, f32::min);
        let max = tensor.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!(min >= 0.0);
        assert!(max <= 1.0);
    }

    #[test]
    fn test_gray_alpha_becomes_three_channels() {
        let img = DynamicImage::ImageLumaA8(GrayAlphaImage::from_pixel(8, 8, LumaA([255, 10])));
        let tensor = prepare_control(&img, ResizeMode::None, 512).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_native_size_must_be_multiple_of_eight() {
        let img = DynamicImage::new_rgb8(30, 20);
        let err = prepare_control(&img, ResizeMode::None, 512).unwrap_err();

        assert!(matches!(err, Error::UnsupportedDimensions { width: 30, height: 20, .. }));
    }
}
