//! Error type shared by the external API clients and the persistence layer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Error communicating with {service}: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Got bad status code {status} from {service}: {body}")]
    BadStatus {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Rate limited by {0}")]
    RateLimited(&'static str),

    #[error("Error decoding response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    /// A row with the same unique key already exists
    #[error("Duplicate key")]
    Duplicate,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl ApiError {
    pub fn is_duplicate(&self) -> bool { matches!(self, ApiError::Duplicate) }
}
