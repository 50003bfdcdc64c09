use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Interrupt already attached to pin {0}")]
    AlreadyAttached(u32),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    pub(crate) fn invalid_pin(pin: u32, max_pin: u32) -> Self {
        GpioError::InvalidArgument(format!("pin {pin} out of range (must be 0-{max_pin})"))
    }
}
