//! Error types for the epochal core library.
//!
//! Uses `thiserror` for public API error types. Summary-ordering problems are
//! never errors (they degrade to a debug log); everything here aborts the
//! operation that raised it.

/// Top-level error type for experiment coordination.
#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("Invalid format template '{template}': {reason}")]
    Template { template: String, reason: String },

    #[error("Cannot render summary row '{label}': {source}")]
    Render {
        label: String,
        #[source]
        source: Box<ExperimentError>,
    },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("State error for '{key}': {reason}")]
    State { key: String, reason: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExperimentError {
    pub fn template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn state(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::State {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExperimentError>;
