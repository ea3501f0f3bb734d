//! Engine Environment
//!
//! One-time bootstrap of the ONNX Runtime environment shared by every
//! classification request. The outcome of the first attempt is cached: a failed
//! bootstrap is never retried, callers keep getting the same error until the
//! process restarts.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("engine environment initialization failed: {0}")]
    InitFailed(String),
}

/// Side-effecting bootstrap routine run at most once per [`EngineEnvironment`]
pub trait EnvironmentBootstrap: Send + Sync {
    fn bootstrap(&self) -> Result<(), String>;
}

/// Bootstraps the global ONNX Runtime environment
#[derive(Debug, Clone, Default)]
pub struct OrtBootstrap {
    /// onnxruntime shared library; only loaded with the `load-dynamic` feature
    pub dylib_path: Option<PathBuf>,
}

impl EnvironmentBootstrap for OrtBootstrap {
    fn bootstrap(&self) -> Result<(), String> {
        if let Some(path) = &self.dylib_path {
            if !path.exists() {
                return Err(format!("onnxruntime library not found at {}", path.display()));
            }
        }

        #[cfg(feature = "load-dynamic")]
        let builder = match &self.dylib_path {
            Some(path) => ort::init_from(path.to_string_lossy().to_string()),
            None => ort::init(),
        };

        #[cfg(not(feature = "load-dynamic"))]
        let builder = {
            if let Some(path) = &self.dylib_path {
                tracing::warn!(
                    path = %path.display(),
                    "ORT_DYLIB_PATH is set but the load-dynamic feature is off, using bundled runtime"
                );
            }
            ort::init()
        };

        builder
            .with_name("vision-gateway")
            .commit()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Uninitialized,
    Ready,
    Failed(String),
}

/// Lazily initialized, read-only-after-init engine environment
pub struct EngineEnvironment {
    bootstrap: Box<dyn EnvironmentBootstrap>,
    outcome: OnceCell<Result<(), EnvironmentError>>,
}

impl EngineEnvironment {
    pub fn new(bootstrap: impl EnvironmentBootstrap + 'static) -> Self {
        Self {
            bootstrap: Box::new(bootstrap),
            outcome: OnceCell::new(),
        }
    }

    /// Run the bootstrap if nobody has yet and return the cached outcome.
    ///
    /// Concurrent first callers block until the single bootstrap finishes and
    /// then all observe its result.
    pub fn ensure_initialized(&self) -> Result<(), EnvironmentError> {
        self.outcome
            .get_or_init(|| match self.bootstrap.bootstrap() {
                Ok(()) => {
                    info!("ONNX Runtime environment initialized");
                    Ok(())
                }
                Err(reason) => {
                    error!(error = %reason, "ONNX Runtime environment initialization failed");
                    Err(EnvironmentError::InitFailed(reason))
                }
            })
            .clone()
    }

    /// Current state without triggering initialization
    pub fn status(&self) -> EnvironmentStatus {
        match self.outcome.get() {
            None => EnvironmentStatus::Uninitialized,
            Some(Ok(())) => EnvironmentStatus::Ready,
            Some(Err(EnvironmentError::InitFailed(reason))) => {
                EnvironmentStatus::Failed(reason.clone())
            }
        }
    }
}
