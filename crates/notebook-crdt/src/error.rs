use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocError {
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("invalid cell type: {0}")]
    InvalidCellType(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("cell index {index} is out of range for {len} cells")]
    IndexOutOfRange { index: u32, len: u32 },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("room connection failed: {0}")]
    Connection(String),

    /// The local replica can no longer be reconciled with the room.
    #[error("document out of sync with collaboration room: {0}")]
    Desync(String),
}

pub type Result<T> = std::result::Result<T, DocError>;
