use thiserror::Error;

/// Errors that can occur in the postal messaging layer.
///
/// Only [`PostalError::Closed`] ever propagates across the public
/// `PostOffice` API — everything else is latent, surfaced only through the
/// `ErrorJournal` (see `error()`).
#[derive(Debug, Error)]
pub enum PostalError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed wire frame: {0}")]
    MalformedFrame(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("the post office has not been initialized or has already been closed")]
    Closed,
}
