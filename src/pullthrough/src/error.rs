use thiserror::Error;

pub type Result<T> = std::result::Result<T, PullThroughError>;

#[derive(Error, Debug)]
pub enum PullThroughError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid duration for {key}: {value:?} ({source})")]
    Duration {
        key: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image copy failed: {0}")]
    Copy(String),
}
