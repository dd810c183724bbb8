use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Source Error - {0}")]
    Source(String),

    #[error("Destination Error - {0}")]
    Destination(String),

    /// The destination rejected the request because of rate limiting or an exceeded quota. This
    /// is the only transient class the watermark emitter recovers from locally.
    #[error("Throttled - {0}")]
    Throttled(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Error::Throttled(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Source(err.to_string())
    }
}
