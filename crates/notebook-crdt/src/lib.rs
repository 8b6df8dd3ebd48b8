//! Collaborative notebook documents on [yrs](https://docs.rs/yrs).
//!
//! - [`NotebookDoc`] keeps a notebook in the Y.Doc layout jupyter_ydoc and
//!   JupyterLab use, and converts to and from nbformat JSON.
//! - [`protocol`] encodes y-sync frames and runs the handshake.
//! - [`RoomClient`] (feature `client`) joins a jupyter-server-documents room
//!   over WebSocket and keeps a local replica in step with it.

pub mod convert;
pub mod doc;
pub mod error;
pub mod protocol;

#[cfg(feature = "client")]
pub mod client;

pub use convert::{any_to_json, json_to_any};
pub use doc::{cell_types, keys, NotebookDoc};
pub use error::{DocError, Result};
pub use protocol::{Message, SyncMessage, SyncProtocol, SyncState};

#[cfg(feature = "client")]
pub use client::{build_room_url, ClientConfig, RoomClient, RoomId};

pub use yrs::StateVector;
