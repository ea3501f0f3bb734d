use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::inference::SessionSpec;
use crate::ocr::OcrCommand;
use crate::text_extraction::TextExtractionSettings;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model: ModelConfig,
    pub classify: AdmissionConfig,
    pub ocr: OcrConfig,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub ort_dylib_path: Option<PathBuf>,
    pub input_name: String,
    pub output_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub max_concurrency: usize,
    pub wait_ms: u64,
}

impl AdmissionConfig {
    pub fn wait_limit(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub admission: AdmissionConfig,
    pub timeout_secs: u64,
    pub command: PathBuf,
    pub device: String,
    pub work_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = required("API_PORT")?;

        let model = ModelConfig {
            model_path: required("MODEL_PATH")?,
            ort_dylib_path: env::var("ORT_DYLIB_PATH").ok().map(PathBuf::from),
            input_name: env::var("MODEL_INPUT_NAME").unwrap_or_else(|_| "input.1".to_string()),
            output_name: env::var("MODEL_OUTPUT_NAME").unwrap_or_else(|_| "700".to_string()),
        };

        let classify = AdmissionConfig {
            max_concurrency: concurrency("CLASSIFY_MAX_CONCURRENCY", 8)?,
            wait_ms: optional("CLASSIFY_WAIT_MS", 3000)?,
        };

        let ocr = OcrConfig {
            admission: AdmissionConfig {
                max_concurrency: concurrency("OCR_MAX_CONCURRENCY", 4)?,
                wait_ms: optional("OCR_WAIT_MS", 5000)?,
            },
            timeout_secs: optional("OCR_TIMEOUT_SECS", 30)?,
            command: env::var("OCR_COMMAND")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("paddlex")),
            device: env::var("OCR_DEVICE").unwrap_or_else(|_| "gpu".to_string()),
            work_dir: env::var("OCR_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
        };

        let max_upload_bytes = optional("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;

        Ok(Self {
            api_host,
            api_port,
            model,
            classify,
            ocr,
            max_upload_bytes,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn session_spec(&self) -> SessionSpec {
        SessionSpec::classifier(
            self.model.model_path.clone(),
            self.model.input_name.clone(),
            self.model.output_name.clone(),
        )
    }

    pub fn text_extraction_settings(&self) -> TextExtractionSettings {
        TextExtractionSettings {
            command: OcrCommand {
                program: self.ocr.command.clone(),
                device: self.ocr.device.clone(),
            },
            max_concurrency: self.ocr.admission.max_concurrency,
            wait_limit: self.ocr.admission.wait_limit(),
            deadline: Duration::from_secs(self.ocr.timeout_secs),
            work_root: self.ocr.work_dir.clone(),
        }
    }
}

fn required<T>(key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).with_context(|| format!("{} must be set", key))?;
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", raw, key, e))
}

fn optional<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value {:?} for {}: {}", raw, key, e)),
        Err(_) => Ok(default),
    }
}

fn concurrency(key: &str, default: usize) -> Result<usize> {
    let value = optional(key, default)?;
    if value == 0 {
        return Err(anyhow!("{} must be at least 1", key));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 15] = [
        "API_HOST",
        "API_PORT",
        "MODEL_PATH",
        "ORT_DYLIB_PATH",
        "MODEL_INPUT_NAME",
        "MODEL_OUTPUT_NAME",
        "CLASSIFY_MAX_CONCURRENCY",
        "CLASSIFY_WAIT_MS",
        "OCR_MAX_CONCURRENCY",
        "OCR_WAIT_MS",
        "OCR_TIMEOUT_SECS",
        "OCR_COMMAND",
        "OCR_DEVICE",
        "OCR_WORK_DIR",
        "MAX_UPLOAD_BYTES",
    ];

    fn reset(vars: &[(&str, &str)]) {
        for key in KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset(&[("API_PORT", "8080"), ("MODEL_PATH", "/models/food.onnx")]);
        let config = Config::load().unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.model.input_name, "input.1");
        assert_eq!(config.model.output_name, "700");
        assert_eq!(config.classify.max_concurrency, 8);
        assert_eq!(config.classify.wait_limit(), Duration::from_secs(3));
        assert_eq!(config.ocr.admission.max_concurrency, 4);
        assert_eq!(config.ocr.admission.wait_limit(), Duration::from_secs(5));
        assert_eq!(config.ocr.command, PathBuf::from("paddlex"));
        assert_eq!(config.ocr.device, "gpu");
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);

        let settings = config.text_extraction_settings();
        assert_eq!(settings.deadline, Duration::from_secs(30));
        assert_eq!(settings.work_root, env::temp_dir());
        reset(&[]);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        reset(&[
            ("API_HOST", "127.0.0.1"),
            ("API_PORT", "9000"),
            ("MODEL_PATH", "model.onnx"),
            ("OCR_MAX_CONCURRENCY", "2"),
            ("OCR_TIMEOUT_SECS", "5"),
            ("OCR_DEVICE", "cpu"),
            ("OCR_WORK_DIR", "/var/tmp/ocr"),
        ]);
        let config = Config::load().unwrap();

        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        let settings = config.text_extraction_settings();
        assert_eq!(settings.max_concurrency, 2);
        assert_eq!(settings.deadline, Duration::from_secs(5));
        assert_eq!(settings.command.device, "cpu");
        assert_eq!(settings.work_root, PathBuf::from("/var/tmp/ocr"));
        reset(&[]);
    }

    #[test]
    #[serial]
    fn test_required_keys() {
        reset(&[("MODEL_PATH", "model.onnx")]);
        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("API_PORT"));

        reset(&[("API_PORT", "8080")]);
        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("MODEL_PATH"));
        reset(&[]);
    }

    #[test]
    #[serial]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            ("API_PORT", "http"),
            ("CLASSIFY_WAIT_MS", "-1"),
            ("CLASSIFY_MAX_CONCURRENCY", "0"),
        ] {
            reset(&[("API_PORT", "8080"), ("MODEL_PATH", "model.onnx"), (key, value)]);
            let err = Config::load().unwrap_err();
            assert!(err.to_string().contains(key), "{}", err);
        }
        reset(&[]);
    }
}
