//! Content safety check on generated images.

use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::session::Session;

use crate::error::{Error, Result};

use super::tensor::f32_value;

/// Input resolution of the CLIP vision tower.
const CLIP_SIZE: u32 = 224;

/// CLIP image normalization mean.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP image normalization standard deviation.
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Ask the safety checker whether `image` contains flagged concepts.
///
/// # Errors
///
/// Returns an error if inference fails or the model has no flag output.
pub fn is_flagged(checker: &mut Session, image: &RgbImage) -> Result<bool> {
    let outputs = checker
        .run(ort::inputs![
            "clip_input" => f32_value(clip_input(image))?,
            "images" => f32_value(images_input(image))?,
        ])
        .map_err(|source| Error::Inference { source })?;

    let flags = outputs
        .iter()
        .find(|(name, _)| *name == "has_nsfw_concepts")
        .map(|(_, value)| value)
        .ok_or_else(|| Error::ShapeMismatch {
            expected: "has_nsfw_concepts output".to_string(),
            actual: "no output".to_string(),
        })?;

    let (_, data) = flags
        .try_extract_tensor::<bool>()
        .map_err(|source| Error::Inference { source })?;

    Ok(data.iter().any(|&flag| flag))
}

/// CLIP-normalized (1, 3, 224, 224) view of the image.
fn clip_input(image: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(image, CLIP_SIZE, CLIP_SIZE, FilterType::CatmullRom);
    let size = CLIP_SIZE as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }

    tensor
}

/// NHWC [0, 1] view of the image.
fn images_input(image: &RgbImage) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);

    let mut tensor = Array4::<f32>::zeros((1, height, width, 3));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = f32::from(pixel[c]) / 255.0;
        }
    }

    tensor
}
