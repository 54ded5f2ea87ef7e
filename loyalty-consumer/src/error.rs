use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("in-flight work did not drain within {0:?}")]
    Timeout(Duration),
}
