//! Runner configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default tokenizer repository (CLIP ViT-L/14, the SD 1.5 text encoder).
pub const DEFAULT_TOKENIZER_MODEL: &str = "openai/clip-vit-large-patch14";

/// Default model registry endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Compute device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// CUDA when the execution provider is available, CPU otherwise.
    #[default]
    Auto,
    /// Always run on the CPU.
    Cpu,
    /// Run on the given CUDA device.
    Cuda(i32),
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device '{s}', expected auto, cpu, cuda or cuda:N")),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// How the input image is resized before it becomes the control tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Always `resolution` x `resolution`, whatever the input aspect ratio.
    #[default]
    Exact,
    /// Short side becomes `resolution`, long side follows the aspect ratio.
    /// Both sides are rounded to the nearest multiple of 64.
    PreserveAspect,
    /// Keep the native size. Both sides must be multiples of 8.
    None,
}

impl ResizeMode {
    /// Dimensions the control image will have for an input of `width` x `height`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn target_dimensions(self, width: u32, height: u32, resolution: u32) -> (u32, u32) {
        match self {
            Self::Exact => (resolution, resolution),
            Self::None => (width, height),
            Self::PreserveAspect => {
                let short = width.min(height).max(1) as f64;
                let scale = f64::from(resolution) / short;
                let round64 = |side: u32| {
                    let scaled = (f64::from(side) * scale / 64.0).round() as u32;
                    scaled.max(1) * 64
                };
                (round64(width), round64(height))
            }
        }
    }
}

impl FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "preserve-aspect" | "preserve_aspect" => Ok(Self::PreserveAspect),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown resize mode '{s}', expected exact, preserve-aspect or none"
            )),
        }
    }
}

/// Accelerator memory handling.
#[derive(Debug, Clone, Default)]
pub struct MemoryStrategy {
    /// Drop each model session as soon as its stage has finished.
    pub offload_between_stages: bool,

    /// Grow the device arena only by the requested amount instead of doubling.
    pub conservative_arena: bool,

    /// Upper bound for the device arena in bytes.
    pub memory_limit: Option<usize>,
}

/// Where the pretrained models come from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    /// Repository holding the text encoder, `UNet`, VAE decoder and safety
    /// checker. The `UNet` must take ControlNet residual inputs. Required
    /// unless `model_dir` is set.
    pub base_model: String,

    /// Repository holding `controlnet/model.onnx`. Required unless
    /// `model_dir` is set.
    pub controlnet_model: String,

    /// Repository holding `tokenizer.json`.
    pub tokenizer_model: String,

    /// Registry revision (branch, tag or commit).
    pub revision: String,

    /// Registry base URL.
    pub endpoint: String,

    /// Read models from this directory instead of the registry.
    pub model_dir: Option<PathBuf>,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            base_model: String::new(),
            controlnet_model: String::new(),
            tokenizer_model: DEFAULT_TOKENIZER_MODEL.to_string(),
            revision: "main".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model_dir: None,
        }
    }
}

/// Configuration for a single transform run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model identifiers and location.
    pub models: ModelSource,

    /// Compute device.
    pub device: Device,

    /// Memory handling on the device.
    pub memory: MemoryStrategy,

    /// Number of denoising steps.
    pub num_steps: u32,

    /// Classifier-free guidance scale. Values <= 1.0 disable guidance.
    pub guidance_scale: f32,

    /// Multiplier applied to the ControlNet residuals.
    pub conditioning_scale: f32,

    /// Prompt used for the unconditional branch of guidance.
    pub negative_prompt: String,

    /// Target resolution of the control image.
    pub resolution: u32,

    /// Resize behavior for the control image.
    pub resize: ResizeMode,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,

    /// Run the content safety checker on the generated image.
    pub safety_checker: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelSource::default(),
            device: Device::Auto,
            memory: MemoryStrategy::default(),
            num_steps: 20,
            guidance_scale: 7.5,
            conditioning_scale: 1.0,
            negative_prompt: String::new(),
            resolution: 512,
            resize: ResizeMode::Exact,
            seed: None,
            safety_checker: false,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 {
            return Err(invalid("num_steps", "must be greater than 0"));
        }

        if !(64..=2048).contains(&self.resolution) || self.resolution % 8 != 0 {
            return Err(invalid(
                "resolution",
                "must be a multiple of 8 between 64 and 2048",
            ));
        }

        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(invalid("guidance_scale", "must be a non-negative number"));
        }

        if !self.conditioning_scale.is_finite() || self.conditioning_scale < 0.0 {
            return Err(invalid(
                "conditioning_scale",
                "must be a non-negative number",
            ));
        }

        if self.models.model_dir.is_none() {
            for (name, value) in [
                ("base_model", &self.models.base_model),
                ("controlnet_model", &self.models.controlnet_model),
            ] {
                if value.trim().is_empty() {
                    return Err(invalid(
                        name,
                        "required unless a model directory is given; \
                         point it at an ONNX export (controlnet/model.onnx, or a \
                         UNet taking ControlNet residuals)",
                    ));
                }
            }
        }

        for (name, value) in [
            ("tokenizer_model", &self.models.tokenizer_model),
            ("revision", &self.models.revision),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(name, "must not be empty"));
            }
        }

        Ok(())
    }

    /// Whether the pipeline runs a separate unconditional branch.
    #[must_use]
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

fn invalid(name: &str, reason: &str) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
