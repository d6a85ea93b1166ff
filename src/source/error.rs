//! Errors from the comick.io adapter.

use crate::catalog::CatalogError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Unsupported host '{host}'. Expected a comick.io comic URL.")]
    UnsupportedHost { host: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not parse comic page: {message}")]
    ParseComicPage { message: String },

    #[error("Invalid --cookies value: {reason}")]
    InvalidCookies { reason: String },

    #[error("Cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<SourceError> for CatalogError {
    fn from(e: SourceError) -> Self {
        CatalogError::CatalogUnavailable {
            reason: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}
