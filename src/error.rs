//! Crate-wide error type and `Result` alias.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors raised while answering an order or talking to external services.
#[derive(Error, Debug)]
pub enum Error {
    #[error("one or more meter IDs not found on registry system: {0:?}")]
    MeterIdsNotFound(Vec<String>),

    #[error("one or more data point for one or more meter IDs not found on registry system: {0:?}")]
    DataPointsMissing(BTreeMap<String, Vec<String>>),

    #[error("dataspace request failed: {0}")]
    Connector(#[from] reqwest::Error),

    #[error("unexpected dataspace payload: {message}")]
    Payload { message: String },

    #[error("solver failure: {message}")]
    Solver { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Shorthand for a malformed upstream payload.
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
