use crate::registry::TensorBinding;
use ndarray::{Array4, ArrayView4};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Edge length of the square tensors the segmentation model works on.
pub const TENSOR_EDGE: usize = 1024;
pub const INPUT_SHAPE: [usize; 4] = [1, 3, TENSOR_EDGE, TENSOR_EDGE];
pub const OUTPUT_LEN: usize = TENSOR_EDGE * TENSOR_EDGE;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Model accepts none of the known tensor bindings (tried {tried:?})")]
    UnboundNames { tried: Vec<String> },
    #[error("Tensor shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("No inference session loaded")]
    NotLoaded,
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A loaded model file, able to run one forward pass at a time.
pub trait InferenceOperator: Send {
    /// Whether the model declares both tensor names of `binding`.
    fn accepts(&self, binding: &TensorBinding) -> bool;

    fn run(
        &mut self,
        binding: &TensorBinding,
        input: ArrayView4<'_, f32>,
        output: &mut [f32],
    ) -> Result<(), SessionError>;
}

pub trait InferenceBackend: Send + Sync + 'static {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceOperator>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Reused,
    Loaded,
}

struct LoadedSession {
    model_path: PathBuf,
    binding: TensorBinding,
    operator: Box<dyn InferenceOperator>,
    input: Array4<f32>,
    output: Vec<f32>,
}

/// Owner of the single resident inference session.
///
/// Loading a different model always releases the previous one first, so at
/// most one model's weights and buffers are alive at a time.
pub struct SessionManager<B: InferenceBackend> {
    backend: B,
    session: Option<LoadedSession>,
}

impl<B: InferenceBackend> SessionManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            session: None,
        }
    }

    pub fn loaded_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.model_path.as_path())
    }

    pub fn is_loaded_for(&self, model_path: &Path) -> bool {
        self.loaded_path() == Some(model_path)
    }

    pub fn binding(&self) -> Option<TensorBinding> {
        self.session.as_ref().map(|s| s.binding)
    }

    pub fn ensure(
        &mut self,
        model_path: &Path,
        bindings: &[TensorBinding],
    ) -> Result<LoadOutcome, SessionError> {
        if self.is_loaded_for(model_path) {
            tracing::debug!(path = %model_path.display(), "Reusing loaded session");
            return Ok(LoadOutcome::Reused);
        }

        self.destroy();

        let operator = self.backend.load(model_path)?;
        let binding = bindings
            .iter()
            .find(|binding| operator.accepts(binding))
            .copied()
            .ok_or_else(|| SessionError::UnboundNames {
                tried: bindings
                    .iter()
                    .map(|b| format!("{}->{}", b.input, b.output))
                    .collect(),
            })?;

        tracing::info!(
            path = %model_path.display(),
            input = binding.input,
            output = binding.output,
            "Loaded inference session"
        );

        self.session = Some(LoadedSession {
            model_path: model_path.to_path_buf(),
            binding,
            operator,
            input: Array4::zeros(INPUT_SHAPE),
            output: vec![0.0; OUTPUT_LEN],
        });

        Ok(LoadOutcome::Loaded)
    }

    /// Runs one forward pass. `input` must hold exactly 3×1024×1024 values in
    /// channel-major order; the returned mask borrows the session's buffer.
    pub fn run_inference(&mut self, input: &[f32]) -> Result<&[f32], SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotLoaded)?;

        let expected = session.input.len();
        if input.len() != expected {
            return Err(SessionError::ShapeMismatch {
                expected,
                actual: input.len(),
            });
        }
        let view = ArrayView4::from_shape(INPUT_SHAPE, input)
            .map_err(|e| SessionError::Inference(e.to_string()))?;
        session.input.assign(&view);

        session
            .operator
            .run(&session.binding, session.input.view(), &mut session.output)?;

        Ok(&session.output)
    }

    /// Releases the loaded session, if any.
    pub fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!(path = %session.model_path.display(), "Releasing inference session");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::RMBG_BINDINGS;
    use std::sync::{Arc, Mutex};

    /// Records load and drop order; echoes the red plane as the mask.
    #[derive(Clone)]
    pub(crate) struct MockBackend {
        pub log: Arc<Mutex<Vec<String>>>,
        pub declared: TensorBinding,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                declared: RMBG_BINDINGS[0],
            }
        }
    }

    impl MockBackend {
        pub fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        pub fn loads(&self) -> usize {
            self.events().iter().filter(|e| e.starts_with("load")).count()
        }
    }

    struct MockOperator {
        name: String,
        declared: TensorBinding,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl InferenceOperator for MockOperator {
        fn accepts(&self, binding: &TensorBinding) -> bool {
            *binding == self.declared
        }

        fn run(
            &mut self,
            _binding: &TensorBinding,
            input: ArrayView4<'_, f32>,
            output: &mut [f32],
        ) -> Result<(), SessionError> {
            for (dst, src) in output.iter_mut().zip(input.iter()) {
                *dst = *src;
            }
            self.log.lock().unwrap().push(format!("run {}", self.name));
            Ok(())
        }
    }

    impl Drop for MockOperator {
        fn drop(&mut self) {
            self.log.lock().unwrap().push(format!("drop {}", self.name));
        }
    }

    impl InferenceBackend for MockBackend {
        fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceOperator>, SessionError> {
            let name = model_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.log.lock().unwrap().push(format!("load {}", name));
            Ok(Box::new(MockOperator {
                name,
                declared: self.declared,
                log: self.log.clone(),
            }))
        }
    }

    fn input_filled(value: f32) -> Vec<f32> {
        vec![value; INPUT_SHAPE.iter().product()]
    }

    #[test]
    fn test_same_path_reuses_session() {
        let backend = MockBackend::default();
        let mut manager = SessionManager::new(backend.clone());
        let path = Path::new("/models/model_fp16.onnx");

        assert_eq!(manager.ensure(path, RMBG_BINDINGS).unwrap(), LoadOutcome::Loaded);
        manager.run_inference(&input_filled(0.1)).unwrap();
        assert_eq!(manager.ensure(path, RMBG_BINDINGS).unwrap(), LoadOutcome::Reused);
        manager.run_inference(&input_filled(0.2)).unwrap();

        assert_eq!(
            backend.events(),
            vec!["load model_fp16.onnx", "run model_fp16.onnx", "run model_fp16.onnx"]
        );
    }

    #[test]
    fn test_switching_model_destroys_before_loading() {
        let backend = MockBackend::default();
        let mut manager = SessionManager::new(backend.clone());

        manager
            .ensure(Path::new("/models/model_fp16.onnx"), RMBG_BINDINGS)
            .unwrap();
        manager
            .ensure(Path::new("/models/model_bnb4.onnx"), RMBG_BINDINGS)
            .unwrap();

        assert_eq!(
            backend.events(),
            vec![
                "load model_fp16.onnx",
                "drop model_fp16.onnx",
                "load model_bnb4.onnx"
            ]
        );
        assert_eq!(
            manager.loaded_path(),
            Some(Path::new("/models/model_bnb4.onnx"))
        );
    }

    #[test]
    fn test_binding_falls_back_to_later_convention() {
        let backend = MockBackend {
            declared: RMBG_BINDINGS[2],
            ..Default::default()
        };
        let mut manager = SessionManager::new(backend);

        manager
            .ensure(Path::new("/models/model.onnx"), RMBG_BINDINGS)
            .unwrap();
        assert_eq!(manager.binding(), Some(RMBG_BINDINGS[2]));
    }

    #[test]
    fn test_unknown_names_fail_without_session() {
        let backend = MockBackend {
            declared: TensorBinding {
                input: "images",
                output: "logits",
            },
            ..Default::default()
        };
        let mut manager = SessionManager::new(backend.clone());

        let result = manager.ensure(Path::new("/models/model.onnx"), RMBG_BINDINGS);

        match result {
            Err(SessionError::UnboundNames { tried }) => assert_eq!(tried.len(), RMBG_BINDINGS.len()),
            other => panic!("expected UnboundNames, got {:?}", other),
        }
        assert!(manager.loaded_path().is_none());
        assert_eq!(backend.events(), vec!["load model.onnx", "drop model.onnx"]);
    }

    #[test]
    fn test_shape_mismatch_keeps_session_usable() {
        let mut manager = SessionManager::new(MockBackend::default());
        manager
            .ensure(Path::new("/models/model.onnx"), RMBG_BINDINGS)
            .unwrap();

        let short = vec![0.0; 3 * 512 * 512];
        match manager.run_inference(&short) {
            Err(SessionError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, 3 * TENSOR_EDGE * TENSOR_EDGE);
                assert_eq!(actual, 3 * 512 * 512);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other.map(|o| o.len())),
        }

        let output = manager.run_inference(&input_filled(0.75)).unwrap();
        assert_eq!(output.len(), OUTPUT_LEN);
        assert!(output.iter().all(|v| *v == 0.75));
    }

    #[test]
    fn test_inference_without_session_fails() {
        let mut manager = SessionManager::new(MockBackend::default());
        assert!(matches!(
            manager.run_inference(&input_filled(0.0)),
            Err(SessionError::NotLoaded)
        ));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let backend = MockBackend::default();
        let mut manager = SessionManager::new(backend.clone());
        manager
            .ensure(Path::new("/models/model.onnx"), RMBG_BINDINGS)
            .unwrap();

        manager.destroy();
        manager.destroy();

        assert!(manager.loaded_path().is_none());
        assert_eq!(backend.events(), vec!["load model.onnx", "drop model.onnx"]);

        assert_eq!(
            manager
                .ensure(Path::new("/models/model.onnx"), RMBG_BINDINGS)
                .unwrap(),
            LoadOutcome::Loaded
        );
    }
}
