use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrapcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Invalid frame: {details}")]
    InvalidFrame { details: String },

    #[error("Failed to open sink at {path}: {source}")]
    SinkOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to sink {path}: {source}")]
    SinkWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tagging API error: {message}")]
    Api { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl TrapcamError {
    pub fn invalid_frame<S: Into<String>>(details: S) -> Self {
        Self::InvalidFrame {
            details: details.into(),
        }
    }

    pub fn api<S: Into<String>>(message: S) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    pub fn component<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrapcamError>;
