//! ONNX session construction for the configured device.

use std::path::Path;

use ort::execution_providers::{ArenaExtendStrategy, CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use crate::config::{Device, MemoryStrategy};
use crate::error::{Error, Result};

/// Whether the CUDA execution provider can be used in this process.
#[must_use]
pub fn accelerator_available() -> bool {
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

/// Builds ONNX sessions bound to one device and memory strategy.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    device: Device,
    memory: MemoryStrategy,
}

impl SessionFactory {
    /// Create a factory, resolving [`Device::Auto`] to a concrete device.
    #[must_use]
    pub fn new(device: Device, memory: MemoryStrategy) -> Self {
        let device = match device {
            Device::Auto if accelerator_available() => Device::Cuda(0),
            Device::Auto => Device::Cpu,
            concrete => concrete,
        };

        Self { device, memory }
    }

    /// The concrete device sessions are created on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Load an ONNX model session.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be loaded or the device cannot be
    /// registered.
    pub fn load(&self, path: &Path, name: &str) -> Result<Session> {
        let model_error = |source| Error::ModelLoad {
            name: name.to_string(),
            source,
        };

        tracing::debug!("Creating session for {name} on {}", self.device);

        let mut builder = Session::builder()
            .map_err(model_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_error)?;

        if let Device::Cuda(device_id) = self.device {
            let mut provider = CUDAExecutionProvider::default().with_device_id(device_id);
            if self.memory.conservative_arena {
                provider = provider.with_arena_extend_strategy(ArenaExtendStrategy::SameAsRequested);
            }
            if let Some(limit) = self.memory.memory_limit {
                provider = provider.with_memory_limit(limit);
            }

            builder = builder
                .with_execution_providers([provider.build().error_on_failure()])
                .map_err(model_error)?;
        }

        builder.commit_from_file(path).map_err(model_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn test_concrete_device_is_kept() {
        let factory = SessionFactory::new(Device::Cpu, MemoryStrategy::default());
        assert_eq!(factory.device(), Device::Cpu);

        let factory = SessionFactory::new(Device::Cuda(1), MemoryStrategy::default());
        assert_eq!(factory.device(), Device::Cuda(1));
    }

    #[test]
    fn test_auto_resolves_to_concrete_device() {
        let factory = SessionFactory::new(Device::Auto, MemoryStrategy::default());
        assert_ne!(factory.device(), Device::Auto);
    }

    #[test]
    fn test_invalid_model_file_is_model_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"not an onnx graph").unwrap();

        let factory = SessionFactory::new(Device::Cpu, MemoryStrategy::default());
        let err = factory.load(&path, "broken").unwrap_err();
        assert_eq!(err.kind(), FailureKind::ModelLoad);
    }
}
