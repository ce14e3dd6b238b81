use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("NVR error: {0}")]
    Nvr(String),

    #[error("Clip not found: {0}")]
    ClipNotFound(String),

    #[error("Clip not ready: {0}")]
    ClipNotReady(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Template error: {0}")]
    Template(String),
}

impl Error {
    /// Fatal errors stop the whole agent instead of restarting the stage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Database(_))
    }
}
