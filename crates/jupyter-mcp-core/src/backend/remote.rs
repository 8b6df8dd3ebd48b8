use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use jupyter_server_client::{Contents, JupyterServer};
use notebook_crdt::{ClientConfig, NotebookDoc, RoomClient, RoomId};

use super::{
    spec_lookup, BackendKind, DocumentBackend, DocumentEntry, EntryKind, InterpreterBackend,
    InterpreterInfo, LiveChannel, LiveDocument, SpecInfo,
};
use crate::error::{Error, Result};
use crate::kernel::{Execution, InterpreterState, KernelChannels, KernelClient, KernelPool};
use crate::notebook::Notebook;

/// How long a refresh listens for pending room traffic.
const ROOM_QUIET: Duration = Duration::from_millis(20);

struct RoomChannel {
    client: RoomClient,
}

#[async_trait]
impl LiveChannel for RoomChannel {
    async fn publish(&mut self, doc: &NotebookDoc) -> Result<()> {
        Ok(self.client.publish(doc).await?)
    }

    async fn refresh(&mut self, doc: &NotebookDoc) -> Result<()> {
        let handled = self.client.pull(doc, ROOM_QUIET).await?;
        if handled > 0 {
            tracing::trace!(handled, "merged room updates");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(self.client.close().await?)
    }
}

fn entry(contents: Contents) -> DocumentEntry {
    DocumentEntry {
        kind: EntryKind::from_wire(&contents.kind),
        path: contents.path,
        size: contents.size,
        last_modified: contents.last_modified,
    }
}

/// Documents served by a Jupyter server's contents API, with live
/// documents joined over its collaboration room socket.
pub struct RemoteDocuments {
    server: JupyterServer,
}

impl RemoteDocuments {
    pub fn new(server: JupyterServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl DocumentBackend for RemoteDocuments {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn read_document(&self, path: &str) -> Result<Notebook> {
        Notebook::from_value(self.server.get_notebook(path).await?)
    }

    async fn save_document(&self, path: &str, notebook: &Notebook) -> Result<()> {
        self.server.save_notebook(path, &notebook.to_value()?).await?;
        Ok(())
    }

    async fn create_document(&self, path: &str) -> Result<bool> {
        if self.document_exists(path).await? {
            return Ok(false);
        }
        self.save_document(path, &Notebook::default()).await?;
        tracing::info!(%path, "created notebook");
        Ok(true)
    }

    async fn document_exists(&self, path: &str) -> Result<bool> {
        Ok(self.server.stat(path).await?.is_some())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DocumentEntry>> {
        Ok(self
            .server
            .list_directory(path)
            .await?
            .into_iter()
            .map(entry)
            .collect())
    }

    async fn open_live_document(&self, path: &str) -> Result<LiveDocument> {
        let file_id = match self.server.file_id(path).await {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                return Err(Error::Configuration(format!(
                    "collaboration is enabled but the server has no file id service: {e}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let room = RoomId::notebook(file_id);
        let url = self
            .server
            .websocket_url(&format!("collaboration/room/{room}"), &[])?;

        let mut client = RoomClient::connect(ClientConfig::new(url.as_str())).await?;
        let doc = NotebookDoc::new();
        client.sync(&doc).await?;
        tracing::debug!(%path, %room, cells = doc.cell_count(), "joined collaboration room");
        Ok(LiveDocument::new(path, doc, Box::new(RoomChannel { client })))
    }
}

/// Kernels of a Jupyter server: lifecycle over REST, execution over each
/// kernel's channel socket.
pub struct RemoteInterpreters {
    server: JupyterServer,
    session_id: String,
    pool: KernelPool,
}

impl RemoteInterpreters {
    pub fn new(server: JupyterServer) -> Self {
        Self {
            server,
            session_id: uuid::Uuid::new_v4().to_string(),
            pool: KernelPool::new(),
        }
    }

    async fn client(&self, id: &str) -> Result<Arc<KernelClient>> {
        self.pool
            .get_or_connect(id, || async {
                let socket = self
                    .server
                    .connect_to_kernel(id, Some(self.session_id.as_str()))
                    .await?;
                tracing::debug!(kernel_id = %id, mode = ?socket.protocol_mode, "kernel socket open");
                let (sink, stream) = socket.split();
                Ok(KernelChannels::new(sink, stream))
            })
            .await
    }
}

fn spec_info(name: String, spec: jupyter_server_client::KernelSpecFile) -> SpecInfo {
    SpecInfo {
        name,
        display_name: spec.display_name,
        language: spec.language,
        env: spec.env,
    }
}

#[async_trait]
impl InterpreterBackend for RemoteInterpreters {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn start_interpreter(&self, spec: Option<&str>, path: Option<&str>) -> Result<String> {
        let kernel = self.server.start_kernel(spec, path).await?;
        tracing::info!(kernel_id = %kernel.id, name = %kernel.name, "started kernel");
        Ok(kernel.id)
    }

    async fn stop_interpreter(&self, id: &str) -> Result<()> {
        self.pool.evict(id).await;
        self.server.shutdown_kernel(id).await?;
        tracing::info!(kernel_id = %id, "stopped kernel");
        Ok(())
    }

    async fn interrupt_interpreter(&self, id: &str) -> Result<()> {
        Ok(self.server.interrupt_kernel(id).await?)
    }

    async fn interpreter_state(&self, id: &str) -> Result<InterpreterState> {
        if let Some(client) = self.pool.get(id).await {
            let state = client.state();
            if state != InterpreterState::Unknown {
                return Ok(state);
            }
        }
        Ok(match self.server.get_kernel(id).await? {
            Some(kernel) => kernel
                .execution_state
                .as_deref()
                .map(InterpreterState::from_wire)
                .unwrap_or_default(),
            None => InterpreterState::Dead,
        })
    }

    async fn list_interpreters(&self) -> Result<Vec<InterpreterInfo>> {
        let specs = spec_lookup(self.list_specs().await?);
        let kernels = self.server.list_kernels().await?;
        Ok(kernels
            .into_iter()
            .map(|kernel| InterpreterInfo {
                state: kernel
                    .execution_state
                    .as_deref()
                    .map(InterpreterState::from_wire)
                    .unwrap_or_default(),
                spec: specs.get(&kernel.name).cloned(),
                connections: Some(kernel.connections),
                last_activity: kernel.last_activity,
                id: kernel.id,
                name: kernel.name,
            })
            .collect())
    }

    async fn list_specs(&self) -> Result<Vec<SpecInfo>> {
        let response = self.server.kernel_specs().await?;
        let mut specs: Vec<SpecInfo> = response
            .kernelspecs
            .into_values()
            .map(|spec| spec_info(spec.name, spec.spec))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
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
