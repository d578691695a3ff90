use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}
