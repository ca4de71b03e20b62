//! Pretrained model fetching and ONNX session construction.

mod loader;
mod session;

pub use loader::{ModelCache, ModelType};
pub use session::{accelerator_available, SessionFactory};
