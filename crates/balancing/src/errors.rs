use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalancingError>;

#[derive(Error, Debug)]
pub enum BalancingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported task count {actual}: the {rule} rule requires exactly {expected} tasks")]
    UnsupportedTaskCount {
        rule: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("numeric instability: {0}")]
    NumericInstability(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl BalancingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::NumericInstability(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for BalancingError {
    fn from(value: toml::de::Error) -> Self {
        BalancingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for BalancingError {
    fn from(value: serde_json::Error) -> Self {
        BalancingError::ConfigFormat(value.to_string())
    }
}

/// Rejects loss lists whose length disagrees with the configured task count.
pub(crate) fn ensure_task_count(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BalancingError::configuration(format!(
            "expected {} task losses, got {}",
            expected, actual
        )))
    }
}

pub(crate) fn ensure_shared_params<T>(params: &[T]) -> Result<()> {
    if params.is_empty() {
        Err(BalancingError::configuration(
            "shared parameter set must not be empty",
        ))
    } else {
        Ok(())
    }
}
