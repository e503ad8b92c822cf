use serde::Deserialize;
use std::path::PathBuf;

pub trait Validatable {
    fn get_path(&self) -> PathBuf;
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub onnx_file: String,
    pub model_dir: PathBuf,
    #[serde(default = "default_model_version")]
    pub version: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
}

fn default_model_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        if self.num_instances == 0 {
            return Err("model.num_instances must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassesConfig {
    pub classes_file: String,
    pub classes_dir: PathBuf,
}

impl ClassesConfig {
    pub fn get_path(&self) -> PathBuf {
        self.classes_dir.join(&self.classes_file)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Grayscale,
    Rgb,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Shorter side to `resize_size`, then centre crop to `image_size`.
    ShorterSide,
    /// Both sides straight to `image_size`.
    Exact,
}

/// Preprocessing parameters. These must match what the model saw at training
/// time and stay fixed for the lifetime of a deployed model.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransformConfig {
    #[serde(default = "default_channels")]
    pub channels: ChannelMode,
    #[serde(default = "default_resize_mode")]
    pub resize_mode: ResizeMode,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_resize_size")]
    pub resize_size: u32,
    #[serde(default = "default_mean")]
    pub mean: Vec<f32>,
    #[serde(default = "default_std")]
    pub std: Vec<f32>,
    /// Uploads with more pixels than this are refused before decoding.
    #[serde(default = "default_max_input_pixels")]
    pub max_input_pixels: u64,
    /// Longer side over shorter side; anything flatter is refused before
    /// resizing.
    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f32,
}

fn default_channels() -> ChannelMode {
    ChannelMode::Grayscale
}

fn default_resize_mode() -> ResizeMode {
    ResizeMode::ShorterSide
}

fn default_image_size() -> u32 {
    224
}

fn default_resize_size() -> u32 {
    // 224 * 1.14, truncated
    255
}

fn default_mean() -> Vec<f32> {
    vec![0.485, 0.456, 0.406]
}

fn default_std() -> Vec<f32> {
    vec![0.229, 0.224, 0.225]
}

fn default_max_input_pixels() -> u64 {
    64 * 1024 * 1024
}

fn default_max_aspect_ratio() -> f32 {
    8.0
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            resize_mode: default_resize_mode(),
            image_size: default_image_size(),
            resize_size: default_resize_size(),
            mean: default_mean(),
            std: default_std(),
            max_input_pixels: default_max_input_pixels(),
            max_aspect_ratio: default_max_aspect_ratio(),
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.image_size == 0 {
            return Err("transform.image_size must be positive".to_string());
        }
        if self.resize_mode == ResizeMode::ShorterSide && self.resize_size < self.image_size {
            return Err(format!(
                "transform.resize_size ({}) must be at least transform.image_size ({})",
                self.resize_size, self.image_size
            ));
        }
        if self.mean.len() != 3 || self.std.len() != 3 {
            return Err("transform.mean and transform.std need exactly 3 values".to_string());
        }
        if self.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err("transform.std values must be positive".to_string());
        }
        if self.max_input_pixels == 0 {
            return Err("transform.max_input_pixels must be positive".to_string());
        }
        if !self.max_aspect_ratio.is_finite() || self.max_aspect_ratio < 1.0 {
            return Err("transform.max_aspect_ratio must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_input_side")]
    pub min_input_side: u32,
}

fn default_max_concurrency() -> usize {
    default_model_instances()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_min_input_side() -> u32 {
    32
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            min_input_side: default_min_input_side(),
        }
    }
}

impl InferenceConfig {
    pub fn get_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}
