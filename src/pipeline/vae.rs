//! Variational Autoencoder decoding.

use ndarray::Array4;
use ort::session::Session;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::tensor::{extract_array4, f32_value};

/// Latent tensor type (1, 4, height / 8, width / 8).
pub type LatentTensor = Array4<f32>;

/// VAE scaling factor (from Stable Diffusion).
pub const VAE_SCALE: f32 = 0.18215;

/// Number of latent channels.
pub const LATENT_CHANNELS: usize = 4;

/// Spatial downsampling between image and latent space.
pub const LATENT_FACTOR: usize = 8;

/// Decode latents back to image space using the VAE decoder.
///
/// # Arguments
///
/// * `decoder` - ONNX session for the VAE decoder
/// * `latent` - Latent tensor in NCHW format (1, 4, h, w)
///
/// # Returns
///
/// Image tensor in NCHW format (1, 3, 8h, 8w) with values in [-1, 1].
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn decode(decoder: &mut Session, latent: &LatentTensor) -> Result<ImageTensor> {
    // Unscale latents
    let unscaled = latent / VAE_SCALE;

    let outputs = decoder
        .run(ort::inputs![f32_value(unscaled)?])
        .map_err(|source| Error::Inference { source })?;

    // Get first output
    let output = outputs
        .values()
        .next()
        .ok_or_else(|| Error::ShapeMismatch {
            expected: "sample output".to_string(),
            actual: "no output".to_string(),
        })?;

    extract_array4(&output)
}
