//! OCR pipeline: admission, per-request workspace, external engine run,
//! artifact parsing, and confidence filtering.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, info};

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::decision::OCR_SCORE_CUTOFF;
use crate::error::GatewayError;
use crate::ocr::{collect_artifacts, run_external_ocr, OcrCommand, OcrWorkspace};

pub const PIPELINE: &str = "ocr";

/// Response body of a successful extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextExtraction {
    pub filtered_texts: Vec<String>,
    /// Visualization image, empty when the engine did not render one
    pub image_base64: String,
}

#[derive(Debug, Clone)]
pub struct TextExtractionSettings {
    pub command: OcrCommand,
    pub max_concurrency: usize,
    pub wait_limit: Duration,
    pub deadline: Duration,
    /// Parent directory for per-request workspaces
    pub work_root: PathBuf,
}

impl Default for TextExtractionSettings {
    fn default() -> Self {
        Self {
            command: OcrCommand::default(),
            max_concurrency: 4,
            wait_limit: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
            work_root: std::env::temp_dir(),
        }
    }
}

pub struct TextExtractionService {
    settings: TextExtractionSettings,
    admission: AdmissionController,
}

impl TextExtractionService {
    pub fn new(settings: TextExtractionSettings) -> Self {
        let admission = AdmissionController::new(PIPELINE, settings.max_concurrency);
        Self {
            settings,
            admission,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub async fn admit(&self) -> Result<AdmissionSlot, GatewayError> {
        Ok(self.admission.acquire(self.settings.wait_limit).await?)
    }

    /// Run the OCR engine over one upload while holding `slot`.
    ///
    /// The workspace and the child process both live inside this future;
    /// returning, failing, or being dropped removes the workspace and kills the
    /// process.
    pub async fn extract(
        &self,
        slot: AdmissionSlot,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<TextExtraction, GatewayError> {
        let _slot = slot;
        let workspace = OcrWorkspace::create(&self.settings.work_root, file_name, bytes).await?;

        let output = run_external_ocr(
            &self.settings.command,
            workspace.input_path(),
            workspace.output_dir(),
            self.settings.deadline,
        )
        .await?;
        debug!(output = %output.text, "OCR process output");

        let artifacts = collect_artifacts(&workspace).await?;
        let filtered_texts = artifacts.recognition.filtered_texts(OCR_SCORE_CUTOFF);
        let image_base64 = artifacts
            .visualization
            .map(|image| base64::engine::general_purpose::STANDARD.encode(image))
            .unwrap_or_default();

        info!(
            recognized = artifacts.recognition.rec_texts.len(),
            kept = filtered_texts.len(),
            has_visualization = !image_base64.is_empty(),
            "Text extracted"
        );
        Ok(TextExtraction {
            filtered_texts,
            image_base64,
        })
    }

    /// Admission plus extraction for an upload already in memory
    pub async fn run(&self, file_name: &str, bytes: &[u8]) -> Result<TextExtraction, GatewayError> {
        let slot = self.admit().await?;
        self.extract(slot, file_name, bytes).await
    }
}
