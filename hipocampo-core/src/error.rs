use thiserror::Error;

use crate::api::ApiError;
use crate::app::AuthError;
use crate::audio::{DeviceError, RecorderError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum HipocampoError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("Other error: {0}")]
    Other(String),
}
