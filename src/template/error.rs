//! Template rendering errors

use thiserror::Error;

/// Reasons a template or connection config cannot be rendered
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The pod template is structurally invalid
    #[error("invalid template at {field}: {message}")]
    InvalidTemplate {
        /// Field path of the offending value
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// A connection parameter is out of range
    #[error("invalid connection config at {field}: {message}")]
    InvalidConnection {
        /// Field path of the offending value
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// The rendered spec could not be serialized for hashing
    #[error("failed to serialize rendered spec: {0}")]
    Serialization(String),
}

impl TemplateError {
    pub(crate) fn template(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn connection(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConnection {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Field path of the offending value, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidTemplate { field, .. } | Self::InvalidConnection { field, .. } => {
                Some(field)
            }
            Self::Serialization(_) => None,
        }
    }

    /// Convert into the crate error, attributing it to `resource`
    pub fn into_error(self, resource: &str) -> crate::Error {
        match self {
            Self::Serialization(msg) => crate::Error::serialization(msg),
            other => {
                let message = other.to_string();
                match other.field() {
                    Some(field) => crate::Error::validation_for_field(resource, field, message),
                    None => crate::Error::validation(resource, message),
                }
            }
        }
    }
}
