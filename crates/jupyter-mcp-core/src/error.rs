use std::fmt;

use jupyter_server_client::ApiError;
use notebook_crdt::DocError;
use thiserror::Error;

/// Stable, machine-readable category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    NotFound,
    AlreadyConnected,
    NoActiveSession,
    Connection,
    InterpreterRestarted,
    InterpreterDied,
    CrdtDesync,
    Protocol,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyConnected => "already_connected",
            ErrorKind::NoActiveSession => "no_active_session",
            ErrorKind::Connection => "connection_error",
            ErrorKind::InterpreterRestarted => "interpreter_restarted",
            ErrorKind::InterpreterDied => "interpreter_died",
            ErrorKind::CrdtDesync => "crdt_desync",
            ErrorKind::Protocol => "protocol_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("session '{name}' is already connected to '{path}'")]
    AlreadyConnected { name: String, path: String },

    #[error("no active session; connect to a notebook or switch to one first")]
    NoActiveSession,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("interpreter {0} was restarted before the execution finished")]
    InterpreterRestarted(String),

    #[error("interpreter {0} died")]
    InterpreterDied(String),

    #[error("live document out of sync, restart the session: {0}")]
    CrdtDesync(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            Error::NoActiveSession => ErrorKind::NoActiveSession,
            Error::Connection(_) => ErrorKind::Connection,
            Error::InterpreterRestarted(_) => ErrorKind::InterpreterRestarted,
            Error::InterpreterDied(_) => ErrorKind::InterpreterDied,
            Error::CrdtDesync(_) => ErrorKind::CrdtDesync,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
        }
    }

    /// Only connectivity failures earn a reconnect and retry.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        if err.is_not_found() {
            match &err {
                ApiError::Status { url, .. } => Error::NotFound(url.clone()),
                _ => Error::NotFound(err.to_string()),
            }
        } else if err.is_transient() {
            Error::Connection(err.to_string())
        } else {
            Error::Protocol(err.to_string())
        }
    }
}

impl From<DocError> for Error {
    fn from(err: DocError) -> Self {
        match err {
            DocError::Desync(reason) => Error::CrdtDesync(reason),
            DocError::Connection(reason) => Error::Connection(reason),
            DocError::IndexOutOfRange { index, len } => Error::Validation(format!(
                "Cell index {index} is out of range. Notebook has {len} cells."
            )),
            DocError::InvalidCellType(kind) => Error::Validation(format!("invalid cell type '{kind}'")),
            other => Error::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
