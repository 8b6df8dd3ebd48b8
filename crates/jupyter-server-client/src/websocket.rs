use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use async_tungstenite::{tokio::ConnectStream, tungstenite::Message, WebSocketStream};
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use jupyter_protocol::{JupyterConnection, JupyterMessage};

use crate::binary_protocol::{default_channel_for_message, deserialize_v1, serialize_v1};

/// Framing negotiated with the server during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    #[default]
    Json,
    BinaryV1,
}

/// A kernel's `/api/kernels/{id}/channels` socket as a stream and sink of
/// [`JupyterMessage`]s.
#[derive(Debug)]
pub struct KernelSocket {
    pub(crate) inner: WebSocketStream<ConnectStream>,
    pub protocol_mode: ProtocolMode,
}

impl KernelSocket {
    fn decode(&self, frame: Message) -> Option<Result<JupyterMessage>> {
        match frame {
            Message::Text(text) => Some(
                serde_json::from_str(&text)
                    .context("kernel sent malformed JSON")
                    .and_then(|value| {
                        JupyterMessage::from_value(value).context("not a Jupyter message")
                    }),
            ),
            Message::Binary(data) => Some(
                deserialize_v1(&data)
                    .map(|(_, msg)| msg)
                    .context("kernel sent a malformed v1 frame"),
            ),
            Message::Ping(_) | Message::Pong(_) => None,
            Message::Frame(_) => {
                tracing::warn!("skipping raw frame on kernel socket");
                None
            }
            // handled by the caller
            Message::Close(_) => None,
        }
    }
}

impl Stream for KernelSocket {
    type Item = Result<JupyterMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let frame = match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(frame))) => frame,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if let Message::Close(reason) = &frame {
                tracing::debug!(?reason, "kernel socket closed by server");
                return Poll::Ready(None);
            }
            if let Some(item) = self.decode(frame) {
                return Poll::Ready(Some(item));
            }
        }
    }
}

impl Sink<JupyterMessage> for KernelSocket {
    type Error = anyhow::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready_unpin(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: JupyterMessage) -> Result<()> {
        let frame = match self.protocol_mode {
            ProtocolMode::Json => Message::Text(
                serde_json::to_string(&item)
                    .context("failed to encode message as JSON")?
                    .into(),
            ),
            ProtocolMode::BinaryV1 => {
                let channel = default_channel_for_message(&item);
                Message::Binary(serialize_v1(&item, channel)?.into())
            }
        };
        self.inner.start_send_unpin(frame).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(Into::into)
    }
}

impl JupyterConnection for KernelSocket {}

pub type KernelSocketReader = futures::stream::SplitStream<KernelSocket>;
pub type KernelSocketWriter = futures::stream::SplitSink<KernelSocket, JupyterMessage>;
