use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;
use url::Url;

use crate::visibility::VisibilityDetector;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "http://127.0.0.1:8000/api/")]
    pub api_base_url: String,

    #[envconfig(default = "3000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "0.5")]
    pub visibility_threshold: f64,

    // Unset means an in-memory storage scope that ends with the process.
    pub storage_path: Option<PathBuf>,

    #[envconfig(default = "false")]
    pub print_sink: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/".to_string(),
            request_timeout: EnvMsDuration(time::Duration::from_millis(3000)),
            visibility_threshold: VisibilityDetector::DEFAULT_THRESHOLD,
            storage_path: None,
            print_sink: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("api base url is not valid: {0}")]
    InvalidApiBase(#[from] url::ParseError),
    #[error("api base url must be http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("visibility threshold must be within (0, 1], got {0}")]
    InvalidThreshold(f64),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api_base()?;

        if !(self.visibility_threshold > 0.0 && self.visibility_threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.visibility_threshold));
        }

        Ok(())
    }

    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.api_base_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
