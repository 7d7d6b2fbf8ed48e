use anyhow::{Context, Result};
use rollcall_core::matcher::{DEFAULT_K, DEFAULT_THRESHOLD};
use rollcall_core::{MatchParams, ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Optional TOML config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub k: Option<usize>,
    pub threshold: Option<f32>,
    pub export_dir: Option<PathBuf>,
    pub warmup_frames: Option<usize>,
}

/// Resolved configuration: defaults < config file < `ROLLCALL_*` env vars.
/// CLI flags are applied on top by the caller.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Neighbors consulted per match.
    pub k: usize,
    /// Maximum mean Euclidean distance for a confident match.
    pub threshold: f32,
    /// Where timestamped attendance files are written.
    pub export_dir: PathBuf,
    /// Frames discarded after opening the camera (AE stabilization).
    pub warmup_frames: usize,
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let file = match config_path() {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let parsed = parse_file(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                tracing::debug!(path = %path.display(), "config file loaded");
                parsed
            }
            _ => FileConfig::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir: env("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(rollcall_core::default_model_dir),
            k: env_parse(&env, "ROLLCALL_K").or(file.k).unwrap_or(DEFAULT_K),
            threshold: env_parse(&env, "ROLLCALL_THRESHOLD")
                .or(file.threshold)
                .unwrap_or(DEFAULT_THRESHOLD),
            export_dir: env("ROLLCALL_EXPORT_DIR")
                .map(PathBuf::from)
                .or(file.export_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            warmup_frames: env_parse(&env, "ROLLCALL_WARMUP_FRAMES")
                .or(file.warmup_frames)
                .unwrap_or(4),
        }
    }

    /// Matching parameters with optional CLI overrides applied.
    pub fn match_params(&self, k: Option<usize>, threshold: Option<f32>) -> Result<MatchParams> {
        let k = k.unwrap_or(self.k);
        let threshold = threshold.unwrap_or(self.threshold);
        MatchParams::new(k, threshold).context("invalid matching parameters")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        model_path(&self.model_dir, SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        model_path(&self.model_dir, ARCFACE_MODEL_FILE)
    }
}

/// `ROLLCALL_CONFIG`, else `$XDG_CONFIG_HOME/rollcall/config.toml`.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(base.join("rollcall/config.toml"))
}

fn parse_file(text: &str) -> Result<FileConfig> {
    Ok(toml::from_str(text)?)
}

fn model_path(dir: &Path, file: &str) -> String {
    dir.join(file).to_string_lossy().into_owned()
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
