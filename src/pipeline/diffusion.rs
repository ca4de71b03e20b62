//! ControlNet-guided Stable Diffusion pipeline.

use std::path::PathBuf;

use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, s, Array3, Array4, ArrayD, Axis};
use ort::session::{Session, SessionInputValue};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::image::{tensor_to_image, ControlTensor};
use crate::model::{ModelCache, ModelType, SessionFactory};
use crate::runner::{Generator, Loader};

use super::safety;
use super::scheduler::DdimScheduler;
use super::tensor::{element_type, extract_array4, extract_arrayd, f32_value, timestep_value};
use super::text::{encode_tokens, PromptTokenizer};
use super::vae::{self, LatentTensor, LATENT_CHANNELS, LATENT_FACTOR};

/// Inputs shared by the ControlNet and the `UNet`.
const SAMPLE_INPUT: &str = "sample";
const TIMESTEP_INPUT: &str = "timestep";
const HIDDEN_STATES_INPUT: &str = "encoder_hidden_states";

/// ControlNet input carrying the control image.
const CONTROL_INPUT: &str = "controlnet_cond";

/// Optional ControlNet input for the residual multiplier.
const CONDITIONING_SCALE_INPUT: &str = "conditioning_scale";

/// Loads the ONNX ControlNet pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

impl Loader for OnnxLoader {
    type Generator = ControlNetPipeline;

    fn load(&self, config: &Config) -> Result<ControlNetPipeline> {
        ControlNetPipeline::new(config.clone())
    }
}

/// One model of the pipeline and its session, if loaded.
struct Stage {
    model: ModelType,
    path: PathBuf,
    session: Option<Session>,
}

impl Stage {
    fn new(model: ModelType, path: PathBuf) -> Self {
        Self {
            model,
            path,
            session: None,
        }
    }

    /// Get the session, creating it on first use.
    fn session(&mut self, factory: &SessionFactory) -> Result<&mut Session> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                tracing::info!("Loading {}...", self.model.filename());
                factory.load(&self.path, self.model.filename())?
            }
        };
        Ok(self.session.insert(session))
    }

    /// Drop the session when offloading between stages.
    fn release(&mut self, offload: bool) {
        if offload && self.session.take().is_some() {
            tracing::debug!("Released {}", self.model.filename());
        }
    }
}

/// Prompt- and image-conditioned generation pipeline.
pub struct ControlNetPipeline {
    config: Config,
    factory: SessionFactory,
    tokenizer: PromptTokenizer,
    text_encoder: Stage,
    controlnet: Stage,
    unet: Stage,
    vae_decoder: Stage,
    safety_checker: Option<Stage>,
}

impl ControlNetPipeline {
    /// Create a new pipeline with the given configuration.
    ///
    /// This will download models if they are not already cached. Sessions are
    /// created up front unless the memory strategy offloads between stages.
    ///
    /// # Errors
    ///
    /// Returns an error if models cannot be fetched or loaded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");

        let cache = ModelCache::new(&config.models)?;
        let tokenizer = PromptTokenizer::new(cache.fetch_tokenizer()?)?;

        let text_encoder = Stage::new(ModelType::TextEncoder, cache.fetch(ModelType::TextEncoder)?);
        let controlnet = Stage::new(ModelType::ControlNet, cache.fetch(ModelType::ControlNet)?);
        let unet = Stage::new(ModelType::Unet, cache.fetch(ModelType::Unet)?);
        let vae_decoder = Stage::new(ModelType::VaeDecoder, cache.fetch(ModelType::VaeDecoder)?);
        let safety_checker = if config.safety_checker {
            Some(Stage::new(
                ModelType::SafetyChecker,
                cache.fetch(ModelType::SafetyChecker)?,
            ))
        } else {
            None
        };

        let factory = SessionFactory::new(config.device, config.memory.clone());
        tracing::info!("Using device {}", factory.device());

        let mut pipeline = Self {
            config,
            factory,
            tokenizer,
            text_encoder,
            controlnet,
            unet,
            vae_decoder,
            safety_checker,
        };

        if !pipeline.config.memory.offload_between_stages {
            pipeline.text_encoder.session(&pipeline.factory)?;
            pipeline.controlnet.session(&pipeline.factory)?;
            residual_input_names(pipeline.unet.session(&pipeline.factory)?)?;
            pipeline.vae_decoder.session(&pipeline.factory)?;
            if let Some(stage) = pipeline.safety_checker.as_mut() {
                stage.session(&pipeline.factory)?;
            }
        }

        tracing::info!("Pipeline initialized successfully");
        Ok(pipeline)
    }

    /// Encode the prompt, prefixed by the negative prompt when guidance is on.
    fn encode_prompts(&mut self, prompt: &str) -> Result<Array3<f32>> {
        let encoder = self.text_encoder.session(&self.factory)?;
        let cond = encode_tokens(encoder, &self.tokenizer.encode(prompt)?)?;

        if !self.config.uses_guidance() {
            return Ok(cond);
        }

        let uncond = encode_tokens(encoder, &self.tokenizer.encode(&self.config.negative_prompt)?)?;
        concatenate(Axis(0), &[uncond.view(), cond.view()]).map_err(|err| Error::ShapeMismatch {
            expected: "matching prompt embeddings".to_string(),
            actual: err.to_string(),
        })
    }

    /// Run the denoising loop from fresh noise.
    #[allow(clippy::cast_possible_truncation)]
    fn denoise(
        &mut self,
        embeddings: &Array3<f32>,
        control: &ControlTensor,
    ) -> Result<LatentTensor> {
        let (_, _, height, width) = control.dim();
        let batch = embeddings.dim().0;
        let guidance_scale = self.config.guidance_scale;

        let mut rng = self
            .config
            .seed
            .map_or_else(rand::rngs::StdRng::from_os_rng, rand::rngs::StdRng::seed_from_u64);

        let scheduler = DdimScheduler::new(self.config.num_steps);
        let shape = (1, LATENT_CHANNELS, height / LATENT_FACTOR, width / LATENT_FACTOR);
        let sigma = scheduler.init_noise_sigma();
        let mut latents: LatentTensor =
            Array4::from_shape_fn(shape, |_| rng.sample::<f32, _>(StandardNormal) * sigma);

        let control_batch = repeat_batch(control, batch)?;

        // Progress bar for denoising
        let pb = ProgressBar::new(scheduler.timesteps().len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("valid template")
                .progress_chars("#>-"),
        );

        for &timestep in scheduler.timesteps() {
            let latent_input = repeat_batch(&latents, batch)?;

            let residuals = self.run_controlnet(&latent_input, timestep, embeddings, &control_batch)?;
            let noise_pred = self.run_unet(&latent_input, timestep, embeddings, residuals)?;

            let noise_pred = if batch > 1 {
                let uncond = noise_pred.slice(s![0..1, .., .., ..]);
                let cond = noise_pred.slice(s![1..2, .., .., ..]);
                &uncond + &((&cond - &uncond) * guidance_scale)
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents);
            pb.inc(1);
        }

        pb.finish_with_message("Denoising complete");
        Ok(latents)
    }

    /// Predict the `UNet` residuals for the control image.
    fn run_controlnet(
        &mut self,
        latents: &LatentTensor,
        timestep: usize,
        embeddings: &Array3<f32>,
        control: &ControlTensor,
    ) -> Result<Vec<ArrayD<f32>>> {
        let session = self.controlnet.session(&self.factory)?;

        let timestep_type = input_type(session, TIMESTEP_INPUT);
        let takes_scale = session.inputs.iter().any(|i| i.name == CONDITIONING_SCALE_INPUT);

        let mut inputs: Vec<(String, SessionInputValue<'static>)> = vec![
            (SAMPLE_INPUT.to_string(), f32_value(latents.clone())?),
            (
                TIMESTEP_INPUT.to_string(),
                timestep_value(timestep_type, timestep, latents.dim().0)?,
            ),
            (HIDDEN_STATES_INPUT.to_string(), f32_value(embeddings.clone())?),
            (CONTROL_INPUT.to_string(), f32_value(control.clone())?),
        ];
        if takes_scale {
            inputs.push((
                CONDITIONING_SCALE_INPUT.to_string(),
                f32_value(ndarray::Array1::from_elem(1, self.config.conditioning_scale))?,
            ));
        }

        let outputs = session
            .run(inputs)
            .map_err(|source| Error::Inference { source })?;

        let mut residuals = outputs
            .values()
            .map(|value| extract_arrayd(&value))
            .collect::<Result<Vec<_>>>()?;

        if !takes_scale {
            let scale = self.config.conditioning_scale;
            for residual in &mut residuals {
                residual.mapv_inplace(|v| v * scale);
            }
        }

        Ok(residuals)
    }

    /// Predict noise with the `UNet`, feeding the ControlNet residuals into its
    /// extra inputs in declaration order.
    fn run_unet(
        &mut self,
        latents: &LatentTensor,
        timestep: usize,
        embeddings: &Array3<f32>,
        residuals: Vec<ArrayD<f32>>,
    ) -> Result<LatentTensor> {
        let session = self.unet.session(&self.factory)?;

        let timestep_type = input_type(session, TIMESTEP_INPUT);
        let residual_names = residual_input_names(session)?;

        if residual_names.len() != residuals.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} ControlNet residuals", residual_names.len()),
                actual: format!("{} residuals", residuals.len()),
            });
        }

        let mut inputs: Vec<(String, SessionInputValue<'static>)> = vec![
            (SAMPLE_INPUT.to_string(), f32_value(latents.clone())?),
            (
                TIMESTEP_INPUT.to_string(),
                timestep_value(timestep_type, timestep, latents.dim().0)?,
            ),
            (HIDDEN_STATES_INPUT.to_string(), f32_value(embeddings.clone())?),
        ];
        for (name, residual) in residual_names.into_iter().zip(residuals) {
            inputs.push((name, f32_value(residual)?));
        }

        let outputs = session
            .run(inputs)
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "noise prediction output".to_string(),
                actual: "no output".to_string(),
            })?;

        extract_array4(&output)
    }
}

impl Generator for ControlNetPipeline {
    fn generate(&mut self, prompt: &str, control: &ControlTensor) -> Result<RgbImage> {
        let (_, _, height, width) = control.dim();
        if height % LATENT_FACTOR != 0 || width % LATENT_FACTOR != 0 {
            return Err(Error::UnsupportedDimensions {
                width: u32::try_from(width).unwrap_or(u32::MAX),
                height: u32::try_from(height).unwrap_or(u32::MAX),
                reason: format!("both sides must be multiples of {LATENT_FACTOR}"),
            });
        }

        let offload = self.config.memory.offload_between_stages;

        // Encode prompt
        tracing::info!("Encoding prompt...");
        let embeddings = self.encode_prompts(prompt)?;
        self.text_encoder.release(offload);

        // Denoise with control
        tracing::info!("Running diffusion...");
        let latents = self.denoise(&embeddings, control)?;
        self.controlnet.release(offload);
        self.unet.release(offload);

        // Decode back to image space
        tracing::info!("Decoding from latent space...");
        let decoded = vae::decode(self.vae_decoder.session(&self.factory)?, &latents)?;
        self.vae_decoder.release(offload);

        let mut image = tensor_to_image(&decoded);

        if let Some(stage) = self.safety_checker.as_mut() {
            if safety::is_flagged(stage.session(&self.factory)?, &image)? {
                tracing::warn!("Safety checker flagged the output, replacing it with a black image");
                image = RgbImage::new(image.width(), image.height());
            }
            stage.release(offload);
        }

        Ok(image)
    }
}

/// Element type the session expects for the named input.
fn input_type(session: &Session, name: &str) -> Option<ort::tensor::TensorElementType> {
    session
        .inputs
        .iter()
        .find(|input| input.name == name)
        .and_then(|input| element_type(&input.input_type))
}

/// Names of the `UNet` inputs that take ControlNet residuals, in declaration
/// order.
///
/// # Errors
///
/// Returns [`Error::IncompatibleModel`] for a plain `UNet` export.
fn residual_input_names(session: &Session) -> Result<Vec<String>> {
    let names = extra_inputs(session.inputs.iter().map(|input| input.name.as_str()));

    if names.is_empty() {
        return Err(Error::IncompatibleModel {
            name: ModelType::Unet.filename().to_string(),
            reason: "no ControlNet residual inputs besides sample, timestep and \
                     encoder_hidden_states"
                .to_string(),
        });
    }

    Ok(names)
}

/// Input names other than the three every `UNet` takes.
fn extra_inputs<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names
        .filter(|name| ![SAMPLE_INPUT, TIMESTEP_INPUT, HIDDEN_STATES_INPUT].contains(name))
        .map(str::to_string)
        .collect()
}

/// Stack `batch` copies of a single-item tensor along the batch axis.
fn repeat_batch(tensor: &Array4<f32>, batch: usize) -> Result<Array4<f32>> {
    if batch <= 1 {
        return Ok(tensor.clone());
    }

    let views = vec![tensor.view(); batch];
    concatenate(Axis(0), &views).map_err(|err| Error::ShapeMismatch {
        expected: format!("{batch} stacked tensors"),
        actual: err.to_string(),
    })
}
