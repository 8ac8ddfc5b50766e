use serde::Deserialize;
use std::path::{Path, PathBuf};

const MODEL_SUBDIR: [&str; 3] = ["models", "RMBG-2.0", "onnx"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub preprocess: PreprocessSettings,
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
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Overrides the directory lookup next to the executable.
    pub model_dir: Option<PathBuf>,
    #[serde(default = "default_download_url")]
    pub download_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_download_url() -> String {
    "https://huggingface.co/camenduru/RMBG-2.0/resolve/main/onnx/{model_id}?download=true".into()
}

fn default_token_env() -> String {
    "HF_TOKEN".into()
}

fn default_request_timeout_secs() -> u64 {
    30 * 60
}

impl ModelConfig {
    /// Root directory for installed weight files.
    ///
    /// Lookup order: the configured `model_dir`, then
    /// `<exe_dir>/../../models/RMBG-2.0/onnx` when it exists, then
    /// `<exe_dir>/models/RMBG-2.0/onnx`. Without a known executable location
    /// the path is relative to the working directory.
    pub fn resolve_model_dir(&self) -> PathBuf {
        if let Some(dir) = &self.model_dir {
            return dir.clone();
        }
        match std::env::current_exe() {
            Ok(exe) => match exe.parent() {
                Some(exe_dir) => model_dir_near(exe_dir),
                None => relative_model_dir(),
            },
            Err(_) => relative_model_dir(),
        }
    }

    /// Bearer token for gated downloads, if the configured variable is set.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.is_empty())
    }
}

fn relative_model_dir() -> PathBuf {
    MODEL_SUBDIR.iter().collect()
}

fn model_dir_near(exe_dir: &Path) -> PathBuf {
    let mut bundled = exe_dir.join("..").join("..");
    bundled.extend(MODEL_SUBDIR);
    if bundled.is_dir() {
        return bundled;
    }
    let mut beside = exe_dir.to_path_buf();
    beside.extend(MODEL_SUBDIR);
    beside
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PreprocessSettings {
    #[serde(default = "default_channel_stat")]
    pub mean: [f32; 3],
    #[serde(default = "default_channel_stat")]
    pub std: [f32; 3],
}

fn default_channel_stat() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            mean: default_channel_stat(),
            std: default_channel_stat(),
        }
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

#[derive(Debug, Deserialize, Clone, PartialEq)]
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
        .map_err(|e| config::ConfigError::Message(format!("no working directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<Config>()
}
