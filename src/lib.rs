pub mod admission;
pub mod api;
pub mod classifier;
pub mod config;
pub mod decision;
pub mod environment;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod ocr;
pub mod preprocess;
pub mod text_extraction;

// Re-export commonly used types for easier testing
pub use crate::admission::{AdmissionController, AdmissionSlot, CapacityExceeded};
pub use crate::api::{router, AppState};
pub use crate::classifier::ClassificationService;
pub use crate::decision::{ClassificationDecision, RecognitionResult, CLASS_LABELS, UNRECOGNIZED_LABEL};
pub use crate::environment::{EngineEnvironment, EnvironmentBootstrap, EnvironmentStatus, OrtBootstrap};
pub use crate::error::GatewayError;
pub use crate::inference::{InferenceEngine, OrtEngine, OutputTensor, SessionSpec};
pub use crate::ocr::OcrCommand;
pub use crate::preprocess::InputTensor;
pub use crate::text_extraction::{TextExtraction, TextExtractionService, TextExtractionSettings};
