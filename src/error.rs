use thiserror::Error;

#[derive(Debug, Error)]
/// Enum for various errors raised by the downsampler and the proxy.
pub enum PsdError {
    #[error("Invalid configuration. {0}")]
    InvalidConfiguration(String),

    #[error("Invalid duration. {0}")]
    InvalidDuration(String),

    #[error("Unknown aggregation. {0}")]
    UnknownAggregation(String),

    #[error("Decoding error. {0}")]
    Decoding(String),

    #[error("Encoding error. {0}")]
    Encoding(String),

    #[error("Remote request failed. {0}")]
    Remote(#[from] reqwest::Error),

    #[error("Unexpected response. {0}")]
    UnexpectedResponse(String),

    #[error("Invalid url. {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

pub type PsdResult<T> = Result<T, PsdError>;
