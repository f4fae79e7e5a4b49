use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerseError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("only the current presenter may update the screen transform")]
    NotPresenter,
}
