//! Backends over the managers of the process hosting us.
//!
//! When embedded in a Jupyter server extension the host hands over its
//! contents, kernel and collaboration-room managers; every operation here is
//! a direct, awaited call into one of them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notebook_crdt::{NotebookDoc, StateVector};
use serde_json::Value;
use thiserror::Error;

use super::{
    spec_lookup, BackendKind, DocumentBackend, DocumentEntry, InterpreterBackend, InterpreterInfo,
    LiveChannel, LiveDocument, SpecInfo,
};
use crate::error::{Error, Result};
use crate::kernel::{Execution, InterpreterState, KernelChannels, KernelPool};
use crate::notebook::Notebook;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("host manager unavailable: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Failed(String),
}

pub type HostResult<T> = std::result::Result<T, HostError>;

impl From<HostError> for Error {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NotFound(what) => Error::NotFound(what),
            HostError::Disconnected(reason) => Error::Connection(reason),
            HostError::Failed(reason) => Error::Protocol(reason),
        }
    }
}

#[async_trait]
pub trait ContentsManager: Send + Sync {
    /// Notebook JSON at `path`.
    async fn get(&self, path: &str) -> HostResult<Value>;
    async fn save(&self, path: &str, notebook: Value) -> HostResult<()>;
    async fn exists(&self, path: &str) -> HostResult<bool>;
    async fn list(&self, path: &str) -> HostResult<Vec<DocumentEntry>>;
}

/// A kernel as the host's kernel manager reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostKernel {
    pub id: String,
    pub name: String,
    pub execution_state: String,
    pub connections: Option<u64>,
    pub last_activity: Option<String>,
}

#[async_trait]
pub trait KernelManager: Send + Sync {
    async fn start(&self, spec: Option<&str>, path: Option<&str>) -> HostResult<String>;
    async fn shutdown(&self, id: &str) -> HostResult<()>;
    async fn interrupt(&self, id: &str) -> HostResult<()>;
    async fn get(&self, id: &str) -> HostResult<Option<HostKernel>>;
    async fn list(&self) -> HostResult<Vec<HostKernel>>;
    async fn specs(&self) -> HostResult<Vec<SpecInfo>>;
    /// In-process message channels to a running kernel.
    async fn connect(&self, id: &str) -> HostResult<KernelChannels>;
}

/// The host's shared copy of one collaborative document.
#[async_trait]
pub trait Room: Send + Sync {
    async fn apply_update(&self, update: &[u8]) -> HostResult<()>;
    /// Everything a replica at `since` is missing.
    async fn encode_diff(&self, since: &StateVector) -> HostResult<Vec<u8>>;
}

#[async_trait]
pub trait RoomManager: Send + Sync {
    async fn open(&self, path: &str) -> HostResult<Arc<dyn Room>>;
}

/// Handles to the host's managers. `rooms` is absent when the host runs
/// without real-time collaboration.
#[derive(Clone)]
pub struct HostManagers {
    pub contents: Arc<dyn ContentsManager>,
    pub kernels: Arc<dyn KernelManager>,
    pub rooms: Option<Arc<dyn RoomManager>>,
}

impl fmt::Debug for HostManagers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostManagers")
            .field("rooms", &self.rooms.is_some())
            .finish_non_exhaustive()
    }
}

struct HostRoomChannel {
    room: Arc<dyn Room>,
    published: StateVector,
}

#[async_trait]
impl LiveChannel for HostRoomChannel {
    async fn publish(&mut self, doc: &NotebookDoc) -> Result<()> {
        let current = doc.state_vector();
        if current == self.published {
            return Ok(());
        }
        self.room.apply_update(&doc.encode_diff(&self.published)).await?;
        self.published = current;
        Ok(())
    }

    async fn refresh(&mut self, doc: &NotebookDoc) -> Result<()> {
        let update = self.room.encode_diff(&doc.state_vector()).await?;
        Ok(doc.apply_update(&update)?)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

pub struct LocalDocuments {
    contents: Arc<dyn ContentsManager>,
    rooms: Option<Arc<dyn RoomManager>>,
}

impl LocalDocuments {
    pub fn new(host: &HostManagers) -> Self {
        Self {
            contents: host.contents.clone(),
            rooms: host.rooms.clone(),
        }
    }
}

#[async_trait]
impl DocumentBackend for LocalDocuments {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn read_document(&self, path: &str) -> Result<Notebook> {
        Notebook::from_value(self.contents.get(path).await?)
    }

    async fn save_document(&self, path: &str, notebook: &Notebook) -> Result<()> {
        Ok(self.contents.save(path, notebook.to_value()?).await?)
    }

    async fn create_document(&self, path: &str) -> Result<bool> {
        if self.contents.exists(path).await? {
            return Ok(false);
        }
        self.save_document(path, &Notebook::default()).await?;
        tracing::info!(%path, "created notebook");
        Ok(true)
    }

    async fn document_exists(&self, path: &str) -> Result<bool> {
        Ok(self.contents.exists(path).await?)
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DocumentEntry>> {
        Ok(self.contents.list(path).await?)
    }

    async fn open_live_document(&self, path: &str) -> Result<LiveDocument> {
        let rooms = self.rooms.as_ref().ok_or_else(|| {
            Error::Configuration("collaboration is enabled but the host has no room manager".into())
        })?;
        let room = rooms.open(path).await?;
        let doc = NotebookDoc::new();
        doc.apply_update(&room.encode_diff(&StateVector::default()).await?)?;
        let published = doc.state_vector();
        tracing::debug!(%path, cells = doc.cell_count(), "joined host room");
        Ok(LiveDocument::new(
            path,
            doc,
            Box::new(HostRoomChannel { room, published }),
        ))
    }
}

pub struct LocalInterpreters {
    kernels: Arc<dyn KernelManager>,
    pool: KernelPool,
}

impl LocalInterpreters {
    pub fn new(host: &HostManagers) -> Self {
        Self {
            kernels: host.kernels.clone(),
            pool: KernelPool::new(),
        }
    }

    async fn client(&self, id: &str) -> Result<Arc<crate::kernel::KernelClient>> {
        self.pool
            .get_or_connect(id, || async { Ok(self.kernels.connect(id).await?) })
            .await
    }
}

#[async_trait]
impl InterpreterBackend for LocalInterpreters {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn start_interpreter(&self, spec: Option<&str>, path: Option<&str>) -> Result<String> {
        let id = self.kernels.start(spec, path).await?;
        tracing::info!(kernel_id = %id, "started kernel");
        Ok(id)
    }

    async fn stop_interpreter(&self, id: &str) -> Result<()> {
        self.pool.evict(id).await;
        self.kernels.shutdown(id).await?;
        tracing::info!(kernel_id = %id, "stopped kernel");
        Ok(())
    }

    async fn interrupt_interpreter(&self, id: &str) -> Result<()> {
        Ok(self.kernels.interrupt(id).await?)
    }

    async fn interpreter_state(&self, id: &str) -> Result<InterpreterState> {
        if let Some(client) = self.pool.get(id).await {
            let state = client.state();
            if state != InterpreterState::Unknown {
                return Ok(state);
            }
        }
        Ok(match self.kernels.get(id).await? {
            Some(kernel) => InterpreterState::from_wire(&kernel.execution_state),
            None => InterpreterState::Dead,
        })
    }

    async fn list_interpreters(&self) -> Result<Vec<InterpreterInfo>> {
        let specs = spec_lookup(self.kernels.specs().await?);
        let kernels = self.kernels.list().await?;
        Ok(kernels
            .into_iter()
            .map(|kernel| InterpreterInfo {
                state: InterpreterState::from_wire(&kernel.execution_state),
                spec: specs.get(&kernel.name).cloned(),
                id: kernel.id,
                name: kernel.name,
                connections: kernel.connections,
                last_activity: kernel.last_activity,
            })
            .collect())
    }

    async fn list_specs(&self) -> Result<Vec<SpecInfo>> {
        Ok(self.kernels.specs().await?)
    }

    async fn execute(&self, id: &str, source: &str) -> Result<Execution> {
        self.client(id).await?.execute(source).await
    }

    async fn wait_idle(&self, id: &str, max: Duration) -> Result<InterpreterState> {
        Ok(self.client(id).await?.wait_idle(max).await)
    }

    async fn reconnect(&self) -> Result<()> {
        let dropped = self.pool.prune().await;
        if dropped > 0 {
            tracing::debug!(dropped, "dropped closed kernel connections");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_errors_map_to_kinds() {
        use crate::ErrorKind;
        assert_eq!(Error::from(HostError::NotFound("x".into())).kind(), ErrorKind::NotFound);
        assert!(Error::from(HostError::Disconnected("gone".into())).is_transient());
        assert_eq!(Error::from(HostError::Failed("bad".into())).kind(), ErrorKind::Protocol);
    }
}
