use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Invalid model selected: {0}")]
    UnknownModel(String),
}

/// Input and output tensor names a model file may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorBinding {
    pub input: &'static str,
    pub output: &'static str,
}

/// Naming conventions seen across RMBG-2.0 exports, most common first.
pub const RMBG_BINDINGS: &[TensorBinding] = &[
    TensorBinding {
        input: "input",
        output: "sigmoid_0",
    },
    TensorBinding {
        input: "x",
        output: "sigmoid",
    },
    TensorBinding {
        input: "input.1",
        output: "output.1",
    },
    TensorBinding {
        input: "pixel_values",
        output: "alphas",
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Catalog key, also the weight file name.
    pub id: &'static str,
    pub name: &'static str,
    pub size_mb: u32,
    pub ram: &'static str,
    pub speed: &'static str,
    pub quality: &'static str,
    pub is_default: bool,
    pub bindings: &'static [TensorBinding],
}

pub const MODEL_CATALOG: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "model.onnx",
        name: "High precision (FP32)",
        size_mb: 1024,
        ram: "~2.0 GB",
        speed: "Slow",
        quality: "Excellent",
        is_default: false,
        bindings: RMBG_BINDINGS,
    },
    ModelDescriptor {
        id: "model_fp16.onnx",
        name: "Balanced (FP16)",
        size_mb: 513,
        ram: "~1.0 GB",
        speed: "Fast",
        quality: "Great",
        is_default: true,
        bindings: RMBG_BINDINGS,
    },
    ModelDescriptor {
        id: "model_quantized.onnx",
        name: "Fast (INT8)",
        size_mb: 366,
        ram: "~700 MB",
        speed: "Very fast",
        quality: "Good",
        is_default: false,
        bindings: RMBG_BINDINGS,
    },
    ModelDescriptor {
        id: "model_bnb4.onnx",
        name: "Ultra fast (Q4)",
        size_mb: 233,
        ram: "~500 MB",
        speed: "Fastest",
        quality: "Acceptable",
        is_default: false,
        bindings: RMBG_BINDINGS,
    },
];

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    model_dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn models(&self) -> &'static [ModelDescriptor] {
        MODEL_CATALOG
    }

    pub fn default_model(&self) -> Option<&'static ModelDescriptor> {
        MODEL_CATALOG.iter().find(|model| model.is_default)
    }

    pub fn validate(&self, model_id: &str) -> Result<&'static ModelDescriptor, RegistryError> {
        MODEL_CATALOG
            .iter()
            .find(|model| model.id == model_id)
            .ok_or_else(|| RegistryError::UnknownModel(model_id.to_string()))
    }

    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(model_id)
    }

    pub fn is_installed(&self, model_id: &str) -> bool {
        self.model_path(model_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_every_catalog_id() {
        let registry = ModelRegistry::new("unused");
        for model in MODEL_CATALOG {
            assert_eq!(registry.validate(model.id), Ok(model));
        }
    }

    #[test]
    fn test_validate_rejects_other_ids() {
        let registry = ModelRegistry::new("unused");
        for id in ["", "model", "MODEL.onnx", "model.onnx ", "../model.onnx", "model_fp32.onnx"] {
            assert_eq!(
                registry.validate(id),
                Err(RegistryError::UnknownModel(id.to_string()))
            );
        }
    }

    #[test]
    fn test_catalog_has_exactly_one_default() {
        let defaults = MODEL_CATALOG.iter().filter(|m| m.is_default).count();
        assert_eq!(defaults, 1);

        let registry = ModelRegistry::new("unused");
        assert_eq!(registry.default_model().map(|m| m.id), Some("model_fp16.onnx"));
    }

    #[test]
    fn test_is_installed_checks_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());

        assert!(!registry.is_installed("model_bnb4.onnx"));
        std::fs::write(registry.model_path("model_bnb4.onnx"), b"weights").unwrap();
        assert!(registry.is_installed("model_bnb4.onnx"));
        assert!(!registry.is_installed("model.onnx"));
    }
}
