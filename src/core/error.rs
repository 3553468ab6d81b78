use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid parameter: {field} - {message}")]
    Validation { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("Invalid solver setting: {0}")]
    InvalidConfig(String),

    #[error(
        "Depletion is not monotonic in income: £{lower_income:.2}/month depletes in {lower_depletion:?} \
         but £{higher_income:.2}/month depletes in {higher_depletion:?}"
    )]
    NonMonotonic {
        lower_income: f64,
        lower_depletion: Option<i32>,
        higher_income: f64,
        higher_depletion: Option<i32>,
    },
}
