//! Kernel WebSocket binary framing (`v1.kernel.websocket.jupyter.org`).
//!
//! ```text
//! u64 LE   n                     number of offsets
//! u64 LE   offsets[n]            byte offset of each part, last one is the end
//! bytes    channel               UTF-8 channel name
//! bytes    header                JSON
//! bytes    parent_header         JSON, `{}` when absent
//! bytes    metadata              JSON
//! bytes    content               JSON
//! bytes    buffers...            raw
//! ```

use anyhow::{anyhow, bail, Context, Result};
use jupyter_protocol::{Channel, Header, JupyterMessage, JupyterMessageContent};
use serde_json::Value;

/// Subprotocol name offered in `Sec-WebSocket-Protocol`.
pub const KERNEL_WEBSOCKET_PROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// channel, header, parent_header, metadata, content
const FIXED_PARTS: usize = 5;

const WORD: usize = std::mem::size_of::<u64>();

fn read_word(data: &[u8], at: usize) -> Result<usize> {
    let bytes: [u8; WORD] = data
        .get(at..at + WORD)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| anyhow!("frame truncated at byte {at}"))?;
    usize::try_from(u64::from_le_bytes(bytes)).context("offset does not fit in memory")
}

pub fn serialize_v1(msg: &JupyterMessage, channel: &str) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&msg.header).context("header")?;
    let parent_header = match &msg.parent_header {
        Some(parent) => serde_json::to_vec(parent).context("parent_header")?,
        None => b"{}".to_vec(),
    };
    let metadata = serde_json::to_vec(&msg.metadata).context("metadata")?;
    let content = serde_json::to_vec(&msg.content).context("content")?;

    let mut parts: Vec<&[u8]> = vec![channel.as_bytes(), &header, &parent_header, &metadata, &content];
    parts.extend(msg.buffers.iter().map(|buffer| buffer.as_ref()));

    let offset_count = parts.len() + 1;
    let mut cursor = WORD * (offset_count + 1);
    let body_len: usize = parts.iter().map(|part| part.len()).sum();

    let mut frame = Vec::with_capacity(cursor + body_len);
    frame.extend_from_slice(&(offset_count as u64).to_le_bytes());
    frame.extend_from_slice(&(cursor as u64).to_le_bytes());
    for part in &parts {
        cursor += part.len();
        frame.extend_from_slice(&(cursor as u64).to_le_bytes());
    }
    for part in parts {
        frame.extend_from_slice(part);
    }
    Ok(frame)
}

pub fn deserialize_v1(data: &[u8]) -> Result<(String, JupyterMessage)> {
    let offset_count = read_word(data, 0)?;
    if offset_count < FIXED_PARTS + 1 {
        bail!("frame carries {offset_count} offsets, expected at least {}", FIXED_PARTS + 1);
    }
    let offsets = (0..offset_count)
        .map(|i| read_word(data, WORD * (i + 1)))
        .collect::<Result<Vec<_>>>()?;

    let part = |index: usize| -> Result<&[u8]> {
        let (start, end) = (offsets[index], offsets[index + 1]);
        data.get(start..end)
            .ok_or_else(|| anyhow!("part {index} spans {start}..{end} of a {} byte frame", data.len()))
    };

    let channel = std::str::from_utf8(part(0)?)
        .context("channel name is not UTF-8")?
        .to_string();
    let header: Header = serde_json::from_slice(part(1)?).context("header")?;
    let parent_header = match part(2)? {
        b"{}" | b"" => None,
        raw => Some(serde_json::from_slice::<Header>(raw).context("parent_header")?),
    };
    let metadata: Value = serde_json::from_slice(part(3)?).context("metadata")?;
    let content: Value = serde_json::from_slice(part(4)?).context("content")?;
    let content = JupyterMessageContent::from_type_and_content(&header.msg_type, content)
        .with_context(|| format!("content of {}", header.msg_type))?;

    let buffers = (FIXED_PARTS..offset_count - 1)
        .map(|i| part(i).map(bytes::Bytes::copy_from_slice))
        .collect::<Result<Vec<_>>>()?;

    let message = JupyterMessage {
        zmq_identities: Vec::new(),
        header,
        parent_header,
        metadata,
        content,
        buffers,
        channel: channel_from_name(&channel),
    };
    Ok((channel, message))
}

fn channel_from_name(name: &str) -> Option<Channel> {
    match name {
        "shell" => Some(Channel::Shell),
        "control" => Some(Channel::Control),
        "stdin" => Some(Channel::Stdin),
        "iopub" => Some(Channel::IOPub),
        "heartbeat" => Some(Channel::Heartbeat),
        _ => None,
    }
}

/// Interrupts and shutdowns go to `control`; every other request rides `shell`.
pub fn default_channel_for_message(msg: &JupyterMessage) -> &'static str {
    match &msg.content {
        JupyterMessageContent::ShutdownRequest(_)
        | JupyterMessageContent::InterruptRequest(_)
        | JupyterMessageContent::DebugRequest(_) => "control",
        _ => "shell",
    }
}
