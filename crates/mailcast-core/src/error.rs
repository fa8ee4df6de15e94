use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailcastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailcastError {
    /// Short error code string, printed by the CLI next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            MailcastError::Config(_) => "CONFIG_ERROR",
            MailcastError::Database(_) => "DATABASE_ERROR",
            MailcastError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MailcastError>;
