use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("kernel websocket: {0:#}")]
    WebSocket(anyhow::Error),
}

impl ApiError {
    /// Connection-level failures worth one reconnect: refused or reset
    /// sockets, timeouts, gateway errors and dropped kernel sockets.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            ApiError::Status { status, .. } => matches!(status, 502..=504),
            ApiError::WebSocket(_) => true,
            ApiError::InvalidUrl(_) | ApiError::Decode { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let missing = ApiError::Status {
            url: "http://localhost:8888/api/contents/x.ipynb".into(),
            status: 404,
            body: "No such file".into(),
        };
        assert!(missing.is_not_found());
        assert!(!missing.is_transient());

        let gateway = ApiError::Status {
            url: "http://localhost:8888/api/kernels".into(),
            status: 503,
            body: String::new(),
        };
        assert!(gateway.is_transient());
        assert!(!gateway.is_not_found());
    }

    #[test]
    fn test_socket_errors_are_transient() {
        let err = ApiError::WebSocket(anyhow::anyhow!("connection reset"));
        assert!(err.is_transient());
        assert!(err.to_string().contains("connection reset"));
    }
}
