//! Image loading, preprocessing, and saving utilities.

mod load;
mod preprocess;
mod save;

pub use load::load_image;
pub use preprocess::prepare_control;
pub use save::{save_image, tensor_to_image};

use ndarray::Array4;

/// Control tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [0, 1] range for ControlNet conditioning.
pub type ControlTensor = Array4<f32>;

/// Decoded image tensor in NCHW format with values in [-1, 1].
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;
