//! Client for the parts of a Jupyter server that a notebook agent talks to.
//!
//! - [`JupyterServer`] covers the REST surface: `/api/contents`, `/api/kernels`,
//!   `/api/kernelspecs` and `/api/fileid`.
//! - [`KernelSocket`] is a kernel's `/channels` WebSocket, speaking either
//!   JSON text frames or the `v1.kernel.websocket.jupyter.org` binary framing,
//!   whichever the server accepts.

pub mod binary_protocol;
mod error;
mod server;
mod websocket;

pub use error::{ApiError, Result};
pub use server::*;
pub use websocket::{KernelSocket, KernelSocketReader, KernelSocketWriter, ProtocolMode};
