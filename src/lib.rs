//! # promptshift
//!
//! Prompt-guided image transformation with a pretrained ControlNet pipeline.
//!
//! The input image becomes the control image of a Stable Diffusion ControlNet
//! pipeline; the prompt steers generation. The crate is built to be driven as
//! a subprocess: the binary takes `INPUT OUTPUT PROMPT` verbatim, then
//! options, prints `output_path is: <OUTPUT>` on success and exits with
//! status 1 otherwise.
//!
//! Models come from a local ONNX export (`model_dir`) or from two registry
//! repositories (`base_model` and `controlnet_model`); one of the two sources
//! is required.
//!
//! ## Example
//!
//! ```no_run
//! use promptshift::{Config, Runner};
//!
//! # fn main() -> promptshift::Result<()> {
//! let mut config = Config::default();
//! config.models.model_dir = Some("models/sd15-controlnet-canny".into());
//! let runner = Runner::new(config)?;
//!
//! let output = runner.run("sketch.png", "render.png", "a watercolor harbor at dusk")?;
//! println!("output_path is: {}", output.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;
pub mod runner;

pub use config::{Config, Device, MemoryStrategy, ModelSource, ResizeMode};
pub use error::{Error, FailureKind, Result};
pub use runner::{Generator, Loader, Runner};
