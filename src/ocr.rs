//! External OCR process orchestration
//!
//! Each request gets its own temporary workspace holding the upload and the
//! engine's output directory. The workspace is removed when it is dropped, and
//! the child process is killed if its future is dropped, so both the deadline
//! and a disconnecting client tear everything down.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::decision::RecognitionResult;
use crate::metrics::OCR_PROCESS_TIMEOUTS;

/// Name used when the upload carries no usable filename
pub const FALLBACK_FILE_NAME: &str = "upload.png";

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("failed to prepare OCR workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error("failed to launch OCR process: {0}")]
    Spawn(#[source] io::Error),

    #[error("OCR process did not finish within {0:?}")]
    Timeout(Duration),

    #[error("OCR process exited with {status}")]
    ProcessFailed { status: String, output: String },

    #[error("OCR result file missing: {}", .0.display())]
    MissingResult(PathBuf),

    #[error("OCR result file is not valid JSON: {0}")]
    InvalidResult(String),
}

/// The external executable and its fixed argument set
#[derive(Debug, Clone)]
pub struct OcrCommand {
    pub program: PathBuf,
    pub device: String,
}

impl Default for OcrCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("paddlex"),
            device: "gpu".to_string(),
        }
    }
}

impl OcrCommand {
    pub fn args(&self, input: &Path, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(14);
        args.push("--pipeline".into());
        args.push("OCR".into());
        args.push("--input".into());
        args.push(input.as_os_str().to_owned());
        for toggle in [
            "--use_doc_orientation_classify",
            "--use_doc_unwarping",
            "--use_textline_orientation",
        ] {
            args.push(toggle.into());
            args.push("False".into());
        }
        args.push("--save_path".into());
        args.push(output_dir.as_os_str().to_owned());
        args.push("--device".into());
        args.push(self.device.as_str().into());
        args
    }
}

/// Reduce a client-supplied filename to a bare file name inside the workspace
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    match last {
        "" | "." | ".." => FALLBACK_FILE_NAME.to_string(),
        other => other.to_string(),
    }
}

/// Per-request temporary directory, removed recursively on drop
#[derive(Debug)]
pub struct OcrWorkspace {
    dir: TempDir,
    input_path: PathBuf,
    output_dir: PathBuf,
    stem: String,
    extension: String,
}

impl OcrWorkspace {
    /// Create a fresh `ocr_task_*` directory under `root` and write the upload into it
    pub async fn create(root: &Path, file_name: &str, bytes: &[u8]) -> Result<Self, OcrError> {
        let root = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix("ocr_task_").tempdir_in(root)
        })
        .await
        .map_err(|e| OcrError::Workspace(io::Error::other(e)))?
        .map_err(OcrError::Workspace)?;

        let file_name = sanitize_file_name(file_name);
        let input_path = dir.path().join(&file_name);
        let output_dir = dir.path().join("output");

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(OcrError::Workspace)?;
        tokio::fs::write(&input_path, bytes)
            .await
            .map_err(OcrError::Workspace)?;

        let name = Path::new(&file_name);
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = name
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        debug!(workspace = %dir.path().display(), file = %file_name, "OCR workspace created");
        Ok(Self {
            dir,
            input_path,
            output_dir,
            stem,
            extension,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<stem>_res.json`
    pub fn result_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_res.json", self.stem))
    }

    /// `<stem>_ocr_res_img<ext>`
    pub fn visualization_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_ocr_res_img{}", self.stem, self.extension))
    }
}

/// Captured stdout followed by stderr
#[derive(Debug, Clone)]
pub struct CombinedOutput {
    pub text: String,
}

/// Run the OCR executable and wait at most `deadline` for it.
///
/// The child is spawned with `kill_on_drop`, so it is killed both when the
/// deadline fires and when the caller's future is dropped.
pub async fn run_external_ocr(
    command: &OcrCommand,
    input: &Path,
    output_dir: &Path,
    deadline: Duration,
) -> Result<CombinedOutput, OcrError> {
    let child = Command::new(&command.program)
        .args(command.args(input, output_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(OcrError::Spawn)?;

    debug!(
        program = %command.program.display(),
        pid = ?child.id(),
        "OCR process started"
    );

    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(result) => result.map_err(OcrError::Spawn)?,
        Err(_) => {
            OCR_PROCESS_TIMEOUTS.inc();
            warn!(deadline_ms = deadline.as_millis() as u64, "OCR process killed at deadline");
            return Err(OcrError::Timeout(deadline));
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(OcrError::ProcessFailed {
            status: output.status.to_string(),
            output: text,
        });
    }

    info!(status = %output.status, "OCR process finished");
    Ok(CombinedOutput { text })
}

/// What the engine left in the output directory
#[derive(Debug, Clone)]
pub struct OcrArtifacts {
    pub recognition: RecognitionResult,
    /// Rendered visualization, if the engine produced one
    pub visualization: Option<Vec<u8>>,
}

/// Read the mandatory result JSON and the optional visualization image
pub async fn collect_artifacts(workspace: &OcrWorkspace) -> Result<OcrArtifacts, OcrError> {
    let result_path = workspace.result_path();
    let bytes = tokio::fs::read(&result_path)
        .await
        .map_err(|_| OcrError::MissingResult(result_path.clone()))?;
    let recognition = RecognitionResult::from_json(&bytes)
        .map_err(|e| OcrError::InvalidResult(e.to_string()))?;

    let visualization_path = workspace.visualization_path();
    let visualization = match tokio::fs::read(&visualization_path).await {
        Ok(image) => Some(image),
        Err(e) => {
            warn!(
                path = %visualization_path.display(),
                error = %e,
                "Visualization image unavailable, responding without it"
            );
            None
        }
    };

    Ok(OcrArtifacts {
        recognition,
        visualization,
    })
}
