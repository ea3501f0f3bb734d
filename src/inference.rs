//! Inference Execution Module
//!
//! Runs the image classifier through ONNX Runtime. Every call builds its own
//! input tensor, output buffer, and session, and all of them are dropped before
//! the call returns, whichever step fails. Concurrency is capped upstream by the
//! admission controller, which is what keeps per-call session creation affordable.

use std::path::PathBuf;

use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics::{Timer, INFERENCE_LATENCY};
use crate::preprocess::InputTensor;

// ============================================================================
// Error Types
// ============================================================================

/// Inference engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Tensor allocation failed: {0}")]
    TensorAlloc(String),

    #[error("Session creation failed: {0}")]
    SessionCreate(String),

    #[error("Inference execution failed: {0}")]
    RunFailed(String),

    #[error("Output shape mismatch: expected {expected:?}, got {actual:?}")]
    OutputShape { expected: Vec<usize>, actual: Vec<i64> },

    #[error("Inference task aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Data Models
// ============================================================================

/// Classifier output `[1, 11]`
pub const CLASSIFIER_OUTPUT_SHAPE: [usize; 2] = [1, 11];

/// Output buffer sized to the engine's declared shape
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl OutputTensor {
    /// Empty buffer with room for exactly `shape.product()` values
    pub fn empty(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: Vec::with_capacity(len),
        }
    }

    /// Copy engine output in, refusing anything that does not match the declared shape
    pub fn fill(&mut self, actual_shape: &[i64], values: &[f32]) -> Result<()> {
        let matches = actual_shape.len() == self.shape.len()
            && actual_shape
                .iter()
                .zip(&self.shape)
                .all(|(&a, &e)| a >= 0 && a as usize == e);
        let expected_len: usize = self.shape.iter().product();
        if !matches || values.len() != expected_len {
            return Err(EngineError::OutputShape {
                expected: self.shape.clone(),
                actual: actual_shape.to_vec(),
            });
        }
        self.data.clear();
        self.data.extend_from_slice(values);
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn scores(&self) -> &[f32] {
        &self.data
    }
}

/// Anything that can turn a preprocessed image into raw class scores
pub trait InferenceEngine: Send + Sync {
    fn run(&self, input: InputTensor) -> Result<OutputTensor>;

    /// Label used for logs and metrics
    fn model_name(&self) -> &str;
}

/// Where the model lives and how its graph is wired
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub model_path: PathBuf,
    pub input_name: String,
    pub output_name: String,
    pub output_shape: Vec<usize>,
    pub intra_threads: usize,
}

impl SessionSpec {
    pub fn classifier(model_path: PathBuf, input_name: String, output_name: String) -> Self {
        Self {
            model_path,
            input_name,
            output_name,
            output_shape: CLASSIFIER_OUTPUT_SHAPE.to_vec(),
            intra_threads: 1,
        }
    }
}

// ============================================================================
// ONNX Runtime engine
// ============================================================================

pub struct OrtEngine {
    spec: SessionSpec,
    model_name: String,
}

impl OrtEngine {
    pub fn new(spec: SessionSpec) -> Self {
        let model_name = spec
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        Self { spec, model_name }
    }

    fn create_session(&self) -> Result<Session> {
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(self.spec.intra_threads))
            .and_then(|b| b.commit_from_file(&self.spec.model_path))
            .map_err(|e| EngineError::SessionCreate(e.to_string()))?;

        let has_input = session.inputs.iter().any(|i| i.name == self.spec.input_name);
        let has_output = session.outputs.iter().any(|o| o.name == self.spec.output_name);
        if !has_input || !has_output {
            return Err(EngineError::SessionCreate(format!(
                "model {} does not declare input '{}' and output '{}'",
                self.spec.model_path.display(),
                self.spec.input_name,
                self.spec.output_name
            )));
        }
        Ok(session)
    }
}

impl InferenceEngine for OrtEngine {
    fn run(&self, input: InputTensor) -> Result<OutputTensor> {
        let timer = Timer::new();
        let input_shape = input.shape();

        let input_value = Tensor::from_array(input.into_array())
            .map_err(|e| EngineError::TensorAlloc(e.to_string()))?;
        let mut output = OutputTensor::empty(self.spec.output_shape.clone());

        let mut session = self.create_session()?;
        debug!(
            model = %self.model_name,
            input_shape = ?input_shape,
            "Executing inference session"
        );

        let outputs = session
            .run(ort::inputs![self.spec.input_name.as_str() => input_value])
            .map_err(|e| EngineError::RunFailed(e.to_string()))?;

        let (shape, values) = outputs[self.spec.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::RunFailed(e.to_string()))?;
        let actual_shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        output.fill(&actual_shape, values)?;

        timer.observe(&INFERENCE_LATENCY, &self.model_name);
        info!(
            model = %self.model_name,
            latency_ms = timer.elapsed_ms(),
            "Inference completed successfully"
        );
        Ok(output)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{normalize, PixelBuffer};
    use image::RgbaImage;

    #[test]
    fn test_output_fill_accepts_declared_shape() {
        let mut out = OutputTensor::empty(vec![1, 11]);
        let values: Vec<f32> = (0..11).map(|i| i as f32).collect();
        out.fill(&[1, 11], &values).unwrap();
        assert_eq!(out.scores(), values.as_slice());
        assert_eq!(out.shape(), &[1, 11]);
    }

    #[test]
    fn test_output_fill_rejects_mismatch() {
        let mut out = OutputTensor::empty(vec![1, 11]);
        let err = out.fill(&[1, 10], &[0.0; 10]).unwrap_err();
        assert!(matches!(err, EngineError::OutputShape { .. }));

        let err = out.fill(&[11], &[0.0; 11]).unwrap_err();
        assert!(matches!(err, EngineError::OutputShape { .. }));
        assert!(out.scores().is_empty());
    }

    #[test]
    fn test_missing_model_is_session_error() {
        let engine = OrtEngine::new(SessionSpec::classifier(
            PathBuf::from("/nonexistent/network.onnx"),
            "input.1".to_string(),
            "700".to_string(),
        ));
        assert_eq!(engine.model_name(), "network");

        let input = normalize(&PixelBuffer::from_rgba(RgbaImage::new(4, 4)));
        let err = engine.run(input).unwrap_err();
        assert!(matches!(err, EngineError::SessionCreate(_)), "got {:?}", err);
    }
}
