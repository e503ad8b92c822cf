use serde::Deserialize;
use std::path::PathBuf;
use xray_prediction::config::{
    ClassesConfig, InferenceConfig, ModelConfig, TransformConfig, Validatable,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub server: ServerConfig,
    #[serde(default)]
    pub previews: PreviewConfig,
    pub model: ModelConfig,
    pub classes: ClassesConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

fn default_project_name() -> String {
    "Chest X-ray Classifier".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get_staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn get_uploads_dir(&self) -> PathBuf {
        self.static_dir.join("uploads")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_max_files() -> usize {
    500
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl Config {
    /// API prefix without a trailing slash; empty when routes live at the root.
    pub fn get_api_prefix(&self) -> String {
        self.api_prefix.trim_end_matches('/').to_string()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        self.transform.validate()?;
        let prefix = self.get_api_prefix();
        if !prefix.is_empty() && !prefix.starts_with('/') {
            return Err(format!("api_prefix must start with '/', got {:?}", prefix));
        }
        if self.inference.max_concurrency == 0 {
            return Err("inference.max_concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("XRAY")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
pub(crate) fn config_from_yaml(yaml: &str) -> Config {
    config::Config::builder()
        .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
        .build()
        .unwrap()
        .try_deserialize::<Config>()
        .unwrap()
}
