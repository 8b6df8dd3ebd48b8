use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::error::{DocError, Result};

const SYNC: u8 = 0;
const AWARENESS: u8 = 1;
const AUTH: u8 = 2;
const AWARENESS_QUERY: u8 = 3;

const SYNC_STEP1: u8 = 0;
const SYNC_STEP2: u8 = 1;
const UPDATE: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sync(SyncMessage),
    /// Presence payload; carried opaquely, never interpreted here.
    Awareness(Vec<u8>),
    /// `Some(reason)` means the room refused us.
    Auth(Option<String>),
    AwarenessQuery,
    Custom(u8, Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    SyncStep1(Vec<u8>),
    /// Everything the receiver of the matching step 1 was missing.
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
}

fn malformed(what: &str, e: impl std::fmt::Display) -> DocError {
    DocError::Protocol(format!("malformed {what}: {e}"))
}

impl Message {
    pub fn step1(sv: &StateVector) -> Self {
        Message::Sync(SyncMessage::SyncStep1(sv.encode_v1()))
    }

    pub fn step2(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::SyncStep2(update))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(update))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let kind: u8 = cursor.read_var().map_err(|e| malformed("message kind", e))?;
        let message = match kind {
            SYNC => {
                let step: u8 = cursor.read_var().map_err(|e| malformed("sync step", e))?;
                let payload = cursor
                    .read_buf()
                    .map_err(|e| malformed("sync payload", e))?
                    .to_vec();
                match step {
                    SYNC_STEP1 => Message::Sync(SyncMessage::SyncStep1(payload)),
                    SYNC_STEP2 => Message::Sync(SyncMessage::SyncStep2(payload)),
                    UPDATE => Message::Sync(SyncMessage::Update(payload)),
                    other => return Err(DocError::Protocol(format!("unknown sync step {other}"))),
                }
            }
            AWARENESS => Message::Awareness(
                cursor
                    .read_buf()
                    .map_err(|e| malformed("awareness payload", e))?
                    .to_vec(),
            ),
            AUTH => {
                let denied: u8 = cursor.read_var().map_err(|e| malformed("auth flag", e))?;
                let reason = if denied == 0 {
                    None
                } else {
                    let raw = cursor.read_buf().map_err(|e| malformed("auth reason", e))?;
                    Some(String::from_utf8_lossy(raw).into_owned())
                };
                Message::Auth(reason)
            }
            AWARENESS_QUERY => Message::AwarenessQuery,
            other => Message::Custom(
                other,
                cursor
                    .read_buf()
                    .map_err(|e| malformed("custom payload", e))?
                    .to_vec(),
            ),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Sync(sync) => {
                buf.write_var(SYNC);
                let (step, payload) = match sync {
                    SyncMessage::SyncStep1(p) => (SYNC_STEP1, p),
                    SyncMessage::SyncStep2(p) => (SYNC_STEP2, p),
                    SyncMessage::Update(p) => (UPDATE, p),
                };
                buf.write_var(step);
                buf.write_buf(payload);
            }
            Message::Awareness(payload) => {
                buf.write_var(AWARENESS);
                buf.write_buf(payload);
            }
            Message::Auth(reason) => {
                buf.write_var(AUTH);
                match reason {
                    Some(reason) => {
                        buf.write_var(1u8);
                        buf.write_buf(reason.as_bytes());
                    }
                    None => buf.write_var(0u8),
                }
            }
            Message::AwarenessQuery => buf.write_var(AWARENESS_QUERY),
            Message::Custom(kind, payload) => {
                buf.write_var(*kind);
                buf.write_buf(payload);
            }
        }
        buf
    }
}

impl SyncMessage {
    pub fn state_vector(&self) -> Result<StateVector> {
        match self {
            SyncMessage::SyncStep1(raw) => {
                StateVector::decode_v1(raw).map_err(|e| malformed("state vector", e))
            }
            _ => Err(DocError::Protocol("only SyncStep1 carries a state vector".into())),
        }
    }
}
