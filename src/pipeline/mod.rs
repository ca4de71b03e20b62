//! ControlNet diffusion pipeline backed by ONNX Runtime.

mod diffusion;
mod safety;
mod scheduler;
mod tensor;
mod text;
mod vae;

pub use diffusion::{ControlNetPipeline, OnnxLoader};
pub use scheduler::DdimScheduler;
pub use text::{PromptTokenizer, MAX_TOKENS};
