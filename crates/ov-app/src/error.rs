use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no connection with socket {0}")]
    UnknownSocket(u64),
    #[error("no connection with uuid {0}")]
    UnknownUuid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("outbound data does not match the connection's configured encoder")]
    EncoderMismatch,
}
