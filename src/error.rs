//! Error kinds shared across the service, store and transport layers.

use std::collections::HashMap;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Input failed a precondition, e.g. a malformed node address.
    #[error("{title}")]
    Validation {
        title: String,
        fields: HashMap<String, String>,
    },

    /// A lookup found no row.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// An insert or update did not affect exactly one row.
    #[error("expected one row to be affected but '{affected}' were")]
    Integrity { affected: u64 },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("failed to encode a database value: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(
        title: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            title: title.into(),
            fields: HashMap::from([(field.into(), message.into())]),
        }
    }

    /// Field-level details, present only on validation errors.
    pub fn field_errors(&self) -> Option<&HashMap<String, String>> {
        match self {
            Self::Validation { fields, .. } => Some(fields),
            _ => None,
        }
    }
}
