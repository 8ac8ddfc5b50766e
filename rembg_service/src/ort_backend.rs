use crate::{
    registry::TensorBinding,
    session::{InferenceBackend, InferenceOperator, SessionError},
};
use ndarray::ArrayView4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::path::Path;

/// Loads ONNX models through ONNX Runtime.
#[derive(Debug, Clone, Default)]
pub struct OrtBackend;

impl OrtBackend {
    fn build_session(&self, model_path: &Path) -> Result<Session, ort::Error> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path)
    }
}

impl InferenceBackend for OrtBackend {
    fn load(&self, model_path: &Path) -> Result<Box<dyn InferenceOperator>, SessionError> {
        let session = self
            .build_session(model_path)
            .map_err(|e| SessionError::Load {
                path: model_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            inputs = ?session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            outputs = ?session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            "Model tensors"
        );

        Ok(Box::new(OrtOperator { session }))
    }
}

struct OrtOperator {
    session: Session,
}

impl InferenceOperator for OrtOperator {
    fn accepts(&self, binding: &TensorBinding) -> bool {
        self.session.inputs.iter().any(|i| i.name == binding.input)
            && self.session.outputs.iter().any(|o| o.name == binding.output)
    }

    fn run(
        &mut self,
        binding: &TensorBinding,
        input: ArrayView4<'_, f32>,
        output: &mut [f32],
    ) -> Result<(), SessionError> {
        let tensor_ref = TensorRef::from_array_view(input)
            .map_err(|e| SessionError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![binding.input => tensor_ref])
            .map_err(|e| SessionError::Inference(e.to_string()))?;

        let (_, data) = outputs[binding.output]
            .try_extract_tensor::<f32>()
            .map_err(|e| SessionError::Inference(format!("failed to extract tensor: {}", e)))?;

        if data.len() != output.len() {
            return Err(SessionError::ShapeMismatch {
                expected: output.len(),
                actual: data.len(),
            });
        }
        output.copy_from_slice(data);

        Ok(())
    }
}
