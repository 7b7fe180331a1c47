use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::error::Elapsed;

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device sent no data before the read timeout")]
    ReadTimeout(#[from] Elapsed),
    #[error("read task failed: {0}")]
    Runtime(#[from] JoinError),
}
