//! WebSocket client for a Jupyter collaboration room.
//!
//! ```rust,ignore
//! use notebook_crdt::{ClientConfig, NotebookDoc, RoomClient, RoomId};
//!
//! let url = build_room_url("ws://localhost:8888", &RoomId::notebook(file_id));
//! let doc = NotebookDoc::new();
//! let mut room = RoomClient::connect(ClientConfig::new(url).with_token(token)).await?;
//! room.sync(&doc).await?;
//! doc.set_cell_source(0, "print('edited')")?;
//! room.publish(&doc).await?;
//! ```

use std::time::Duration;

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::client::IntoClientRequest;
use async_tungstenite::tungstenite::http::HeaderValue;
use async_tungstenite::tungstenite::Message as WsMessage;
use async_tungstenite::WebSocketStream;
use futures::StreamExt as _;
use yrs::StateVector;

use crate::doc::NotebookDoc;
use crate::error::{DocError, Result};
use crate::protocol::{Message, SyncProtocol, SyncState};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub token: Option<String>,
    pub user_agent: String,
    /// Bound on the initial handshake.
    pub sync_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            user_agent: concat!("notebook-crdt/", env!("CARGO_PKG_VERSION")).to_string(),
            sync_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    fn build_url(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}token={token}", self.url)
            }
            None => self.url.clone(),
        }
    }
}

/// One replica's connection to a room. The caller owns the [`NotebookDoc`];
/// the client only moves updates in and out of it.
pub struct RoomClient {
    stream: WebSocketStream<ConnectStream>,
    protocol: SyncProtocol,
    sync_timeout: Duration,
    /// What the room is known to have; publishes send only the difference.
    published: Option<StateVector>,
}

impl RoomClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let mut request = config
            .build_url()
            .into_client_request()
            .map_err(|e| DocError::Connection(format!("bad room url: {e}")))?;
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| DocError::Connection(format!("bad user agent: {e}")))?;
        request.headers_mut().insert("User-Agent", agent);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| DocError::Connection(e.to_string()))?;
        tracing::debug!(url = %config.url, "joined collaboration room");

        Ok(Self {
            stream,
            protocol: SyncProtocol::new(),
            sync_timeout: config.sync_timeout,
            published: None,
        })
    }

    pub fn sync_state(&self) -> SyncState {
        self.protocol.state()
    }

    /// Runs the handshake until the room's state has been merged into `doc`.
    pub async fn sync(&mut self, doc: &NotebookDoc) -> Result<()> {
        let hello = self.protocol.start(doc);
        self.send(&hello).await?;

        let deadline = tokio::time::Instant::now() + self.sync_timeout;
        while !self.protocol.is_synced() {
            let msg = tokio::time::timeout_at(deadline, self.receive())
                .await
                .map_err(|_| DocError::Connection("room did not answer the sync handshake".into()))??;
            match msg {
                Some(msg) => self.handle(doc, msg).await?,
                None => return Err(DocError::Connection("room closed during sync".into())),
            }
        }
        self.published = Some(doc.state_vector());
        Ok(())
    }

    /// Sends local changes made since the last publish.
    pub async fn publish(&mut self, doc: &NotebookDoc) -> Result<()> {
        let since = self.published.clone().unwrap_or_default();
        let current = doc.state_vector();
        if self.published.as_ref() == Some(&current) {
            return Ok(());
        }
        self.send(&Message::update(doc.encode_diff(&since))).await?;
        self.published = Some(current);
        Ok(())
    }

    /// Applies whatever the room has sent, waiting at most `quiet` for the
    /// next frame. Returns how many messages were handled.
    pub async fn pull(&mut self, doc: &NotebookDoc, quiet: Duration) -> Result<usize> {
        let mut handled = 0;
        while let Ok(next) = tokio::time::timeout(quiet, self.receive()).await {
            match next? {
                Some(msg) => {
                    self.handle(doc, msg).await?;
                    handled += 1;
                }
                None => return Err(DocError::Connection("room closed".into())),
            }
        }
        Ok(handled)
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.stream
            .send(WsMessage::Binary(msg.encode().into()))
            .await
            .map_err(|e| DocError::Connection(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Message::decode(&data).map(Some),
                Some(Ok(WsMessage::Ping(data))) => {
                    self.stream
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(|e| DocError::Connection(e.to_string()))?;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(DocError::Connection(e.to_string())),
            }
        }
    }

    async fn handle(&mut self, doc: &NotebookDoc, msg: Message) -> Result<()> {
        match msg {
            Message::Sync(sync) => {
                for reply in self.protocol.handle(doc, &sync)? {
                    self.send(&reply).await?;
                }
            }
            Message::Auth(Some(reason)) => {
                return Err(DocError::Connection(format!("room refused access: {reason}")))
            }
            Message::Auth(None) | Message::Awareness(_) | Message::AwarenessQuery => {}
            Message::Custom(kind, _) => tracing::debug!(kind, "ignoring custom room message"),
        }
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| DocError::Connection(e.to_string()))
    }
}

/// Room name `{format}:{type}:{id}`. jupyter-server-documents keys notebook
/// rooms by file id: `json:notebook:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    pub format: String,
    pub doc_type: String,
    pub id: String,
}

impl RoomId {
    pub fn new(format: impl Into<String>, doc_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            doc_type: doc_type.into(),
            id: id.into(),
        }
    }

    pub fn notebook(file_id: impl Into<String>) -> Self {
        Self::new("json", "notebook", file_id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(format), Some(doc_type), Some(id)) => Some(Self::new(format, doc_type, id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.format, self.doc_type, self.id)
    }
}

/// `ws(s)://host/.../api/collaboration/room/{room}` from a server base URL.
pub fn build_room_url(base_url: &str, room: &RoomId) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/api/collaboration/room/{room}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_url_with_token() {
        let config = ClientConfig::new("ws://localhost:8888/api/collaboration/room/x").with_token("t");
        assert_eq!(config.build_url(), "ws://localhost:8888/api/collaboration/room/x?token=t");

        let config = ClientConfig::new("ws://h/room?a=1").with_token("t");
        assert_eq!(config.build_url(), "ws://h/room?a=1&token=t");
    }

    #[test]
    fn test_room_id() {
        let room = RoomId::notebook("dcd20096-cdcf");
        assert_eq!(room.to_string(), "json:notebook:dcd20096-cdcf");
        assert_eq!(RoomId::parse("json:notebook:dcd20096-cdcf"), Some(room));
        assert_eq!(
            RoomId::parse("text:file:dir/with:colon.txt").map(|r| r.id),
            Some("dir/with:colon.txt".to_string())
        );
        assert!(RoomId::parse("nocolons").is_none());
    }

    #[test]
    fn test_build_room_url() {
        let room = RoomId::notebook("abc");
        assert_eq!(
            build_room_url("http://localhost:8888/", &room),
            "ws://localhost:8888/api/collaboration/room/json:notebook:abc"
        );
        assert_eq!(
            build_room_url("https://hub.example.com/user/me", &room),
            "wss://hub.example.com/user/me/api/collaboration/room/json:notebook:abc"
        );
    }
}
