//! Grounded on `gproxy-provider-core::errors::ProviderError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported operation for this provider: {0}")]
    Unsupported(&'static str),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
    #[error("missing credential field: {0}")]
    MissingCredentialField(&'static str),
    #[error("{0}")]
    Other(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
