//! The image transform runner: load, preprocess, generate, save.

use std::path::{Path, PathBuf};

use ::image::{GenericImageView, RgbImage};

use crate::config::Config;
use crate::error::Result;
use crate::image::{self, ControlTensor};
use crate::model;
use crate::pipeline::OnnxLoader;

/// A loaded conditional generation model.
///
/// Given a prompt and a control tensor it produces one image whose size
/// matches the control tensor's spatial dimensions.
pub trait Generator {
    /// Generate an image.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn generate(&mut self, prompt: &str, control: &ControlTensor) -> Result<RgbImage>;
}

/// Fetches and initializes a [`Generator`].
pub trait Loader {
    /// The generator this loader produces.
    type Generator: Generator;

    /// Load the generator for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if any model cannot be fetched or initialized.
    fn load(&self, config: &Config) -> Result<Self::Generator>;
}

/// Runs one prompt-guided transformation per call.
pub struct Runner<L = OnnxLoader> {
    config: Config,
    loader: L,
}

impl Runner<OnnxLoader> {
    /// Create a runner backed by the ONNX ControlNet pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_loader(config, OnnxLoader)
    }
}

impl<L: Loader> Runner<L> {
    /// Create a runner with a custom model loader.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_loader(config: Config, loader: L) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, loader })
    }

    /// Transform the image at `input_path` under `prompt` and write the result
    /// to `output_path`.
    ///
    /// The input is decoded before any model is fetched, so a bad input fails
    /// fast. Nothing is written to `output_path` unless the whole run succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error classified by [`crate::Error::kind`].
    pub fn run<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_path: P,
        output_path: Q,
        prompt: &str,
    ) -> Result<PathBuf> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        let input = image::load_image(input_path)?;

        let (width, height) = input.dimensions();
        tracing::info!(
            "Paths: {} -> {} ({width}x{height}, {:?})",
            input_path.display(),
            output_path.display(),
            input.color()
        );
        tracing::info!("Prompt: {prompt:?}");
        tracing::info!(
            "Device: {} (accelerator available: {})",
            self.config.device,
            model::accelerator_available()
        );

        tracing::info!("Loading models...");
        let mut generator = self.loader.load(&self.config)?;

        if self.config.safety_checker {
            tracing::info!("Content safety checker enabled");
        } else {
            tracing::warn!("Content safety checker disabled");
        }

        let control = image::prepare_control(&input, self.config.resize, self.config.resolution)?;

        tracing::info!("Running generation ({} steps)...", self.config.num_steps);
        let output = generator.generate(prompt, &control)?;

        tracing::info!("Saving output to: {}", output_path.display());
        image::save_image(&output, output_path)?;

        tracing::info!("Processing complete");
        Ok(output_path.to_path_buf())
    }
}
