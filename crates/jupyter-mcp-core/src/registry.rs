//! Open notebook sessions and the active-session pointer.
//!
//! The registry is the only place interpreters are started or stopped. Each
//! [`Session`] owns its document write path, chosen when it connects: a
//! live CRDT replica when collaboration is on, file-mode read-modify-write
//! otherwise. The choice never changes for the session's lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::Serialize;

use crate::backend::{BackendKind, CellEdit, DocumentBackend, LiveDocument};
use crate::error::{Error, Result};
use crate::kernel::InterpreterState;
use crate::mode::ModeContext;
use crate::notebook::{cell_position, Cell, CellType, Notebook};
use crate::output::CellOutput;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The document write path a session was opened with.
#[derive(Debug, Clone)]
pub enum DocumentHandle {
    Live(Arc<LiveDocument>),
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    id: String,
    dead: bool,
}

pub struct Session {
    name: String,
    path: String,
    documents: BackendKind,
    document: DocumentHandle,
    binding: Mutex<Option<Binding>>,
    running: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("documents", &self.documents)
            .field("binding", &*lock(&self.binding))
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn documents(&self) -> BackendKind {
        self.documents
    }

    pub fn live(&self) -> Option<&Arc<LiveDocument>> {
        match &self.document {
            DocumentHandle::Live(live) => Some(live),
            DocumentHandle::File => None,
        }
    }

    pub fn interpreter_id(&self) -> Option<String> {
        lock(&self.binding).as_ref().map(|b| b.id.clone())
    }

    /// Whether an execution currently holds this session.
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Serializes executions within the session.
    pub(crate) async fn begin_execution(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.running.lock().await
    }

    fn bind(&self, id: String) {
        *lock(&self.binding) = Some(Binding { id, dead: false });
    }

    fn take_binding(&self) -> Option<String> {
        lock(&self.binding).take().map(|b| b.id)
    }

    pub async fn read(&self, documents: &dyn DocumentBackend) -> Result<Notebook> {
        match &self.document {
            DocumentHandle::Live(live) => live.snapshot().await,
            DocumentHandle::File => documents.read_document(&self.path).await,
        }
    }

    /// Inserts a cell; `-1` appends. Returns the position used.
    pub async fn insert_cell(
        &self,
        documents: &dyn DocumentBackend,
        index: i64,
        cell_type: CellType,
        source: &str,
    ) -> Result<usize> {
        match &self.document {
            DocumentHandle::Live(live) => live.insert_cell(index, cell_type, source).await,
            DocumentHandle::File => {
                let edit = CellEdit::Insert {
                    index,
                    cell_type,
                    source: source.to_string(),
                };
                documents.write_cell(&self.path, edit).await
            }
        }
    }

    /// Replaces a cell's source, returning what it was.
    pub async fn set_source(
        &self,
        documents: &dyn DocumentBackend,
        index: i64,
        source: &str,
    ) -> Result<String> {
        match &self.document {
            DocumentHandle::Live(live) => live.set_source(index, source).await,
            DocumentHandle::File => {
                let mut notebook = documents.read_document(&self.path).await?;
                let at = cell_position(index, notebook.len())?;
                let old = notebook.cells[at].source().to_string();
                notebook.cells[at].set_source(source);
                documents.save_document(&self.path, &notebook).await?;
                Ok(old)
            }
        }
    }

    pub async fn delete_cell(&self, documents: &dyn DocumentBackend, index: i64) -> Result<Cell> {
        match &self.document {
            DocumentHandle::Live(live) => live.delete_cell(index).await,
            DocumentHandle::File => documents.delete_cell(&self.path, index).await,
        }
    }

    /// Replaces the outputs of the cell at `index` in one write.
    pub async fn write_outputs(
        &self,
        documents: &dyn DocumentBackend,
        index: usize,
        outputs: &[CellOutput],
        execution_count: Option<i64>,
    ) -> Result<()> {
        match &self.document {
            DocumentHandle::Live(live) => {
                live.replace_outputs(index, outputs, execution_count).await
            }
            DocumentHandle::File => {
                documents
                    .write_outputs(&self.path, index, outputs, execution_count)
                    .await
            }
        }
    }

    /// Pushes unpublished live edits; file-mode sessions have nothing to do.
    pub async fn publish(&self) -> Result<()> {
        match &self.document {
            DocumentHandle::Live(live) => live.publish().await,
            DocumentHandle::File => Ok(()),
        }
    }
}

/// One row of [`SessionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub path: String,
    pub active: bool,
    pub interpreter_id: Option<String>,
    pub state: InterpreterState,
    pub documents: BackendKind,
    pub live: bool,
}

/// Result of [`SessionRegistry::connect`].
#[derive(Debug, Clone)]
pub struct Connected {
    pub session: Arc<Session>,
    /// The document did not exist and was created.
    pub created: bool,
    /// The session was already registered for this path.
    pub existing: bool,
}

#[derive(Default)]
struct Sessions {
    by_name: BTreeMap<String, Arc<Session>>,
    active: Option<String>,
}

pub struct SessionRegistry {
    ctx: Arc<ModeContext>,
    sessions: Mutex<Sessions>,
    /// Held across connect/restart/disconnect and replacement starts so
    /// lifecycle changes don't interleave.
    lifecycle: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = lock(&self.sessions);
        f.debug_struct("SessionRegistry")
            .field("sessions", &sessions.by_name.keys().collect::<Vec<_>>())
            .field("active", &sessions.active)
            .finish()
    }
}

fn unknown_session(name: &str) -> Error {
    Error::NotFound(format!("notebook '{name}'"))
}

impl SessionRegistry {
    pub fn new(ctx: Arc<ModeContext>) -> Self {
        Self {
            ctx,
            sessions: Mutex::default(),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<ModeContext> {
        &self.ctx
    }

    pub fn get(&self, name: &str) -> Result<Arc<Session>> {
        lock(&self.sessions)
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_session(name))
    }

    pub fn active(&self) -> Result<Arc<Session>> {
        let sessions = lock(&self.sessions);
        sessions
            .active
            .as_ref()
            .and_then(|name| sessions.by_name.get(name))
            .cloned()
            .ok_or(Error::NoActiveSession)
    }

    pub fn active_name(&self) -> Option<String> {
        lock(&self.sessions).active.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn owner_of(&self, interpreter_id: &str) -> Option<String> {
        lock(&self.sessions)
            .by_name
            .values()
            .find(|s| s.interpreter_id().as_deref() == Some(interpreter_id))
            .map(|s| s.name.clone())
    }

    /// Opens `path` as session `name`, creating the document first when
    /// `create` is set, and binds an interpreter: `interpreter_id` when it
    /// is alive, a fresh one otherwise. The first session becomes active.
    pub async fn connect(
        &self,
        name: &str,
        path: &str,
        create: bool,
        interpreter_id: Option<&str>,
    ) -> Result<Connected> {
        if name.trim().is_empty() {
            return Err(Error::validation("session name must not be empty"));
        }
        let _lifecycle = self.lifecycle.lock().await;

        if let Ok(session) = self.get(name) {
            if session.path == path {
                return Ok(Connected {
                    session,
                    created: false,
                    existing: true,
                });
            }
            return Err(Error::AlreadyConnected {
                name: name.to_string(),
                path: session.path.clone(),
            });
        }
        if let Some(owner) = interpreter_id.and_then(|id| self.owner_of(id)) {
            return Err(Error::validation(format!(
                "interpreter {} is already bound to notebook '{owner}'",
                interpreter_id.unwrap_or_default()
            )));
        }

        let backend = self.ctx.resolve()?;
        let created = if create {
            backend.documents.create_document(path).await?
        } else if backend.documents.document_exists(path).await? {
            false
        } else {
            return Err(Error::NotFound(format!("notebook '{path}'")));
        };

        let document = if self.ctx.config().collaboration {
            DocumentHandle::Live(Arc::new(backend.documents.open_live_document(path).await?))
        } else {
            DocumentHandle::File
        };

        let interpreter = match self.bind_interpreter(path, interpreter_id).await {
            Ok(id) => id,
            Err(e) => {
                if let DocumentHandle::Live(live) = &document {
                    if let Err(close) = live.close().await {
                        tracing::warn!(%path, error = %close, "failed to close live document");
                    }
                }
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            name: name.to_string(),
            path: path.to_string(),
            documents: backend.documents.kind(),
            document,
            binding: Mutex::new(Some(Binding {
                id: interpreter.clone(),
                dead: false,
            })),
            running: tokio::sync::Mutex::new(()),
        });
        {
            let mut sessions = lock(&self.sessions);
            sessions.by_name.insert(name.to_string(), session.clone());
            if sessions.active.is_none() {
                sessions.active = Some(name.to_string());
            }
        }
        tracing::info!(session = %name, %path, kernel_id = %interpreter, created, "connected notebook");
        Ok(Connected {
            session,
            created,
            existing: false,
        })
    }

    async fn bind_interpreter(&self, path: &str, requested: Option<&str>) -> Result<String> {
        let interpreters = self.ctx.resolve()?.interpreters;
        if let Some(id) = requested {
            match interpreters.interpreter_state(id).await {
                Ok(state) if state.is_alive() => return Ok(id.to_string()),
                Ok(state) => tracing::warn!(kernel_id = %id, %state, "requested interpreter is not alive, starting a new one"),
                Err(e) if e.kind() == crate::ErrorKind::NotFound => {
                    tracing::warn!(kernel_id = %id, "requested interpreter does not exist, starting a new one")
                }
                Err(e) => return Err(e),
            }
        }
        interpreters.start_interpreter(None, Some(path)).await
    }

    /// Moves the active pointer. No I/O.
    pub fn switch(&self, name: &str) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        if !sessions.by_name.contains_key(name) {
            return Err(unknown_session(name));
        }
        sessions.active = Some(name.to_string());
        tracing::debug!(session = %name, "switched active session");
        Ok(())
    }

    /// Replaces the session's interpreter with a fresh one and returns its
    /// id. Executions still running on the old one fail with
    /// `InterpreterRestarted`.
    pub async fn restart(&self, name: &str) -> Result<String> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.get(name)?;
        let interpreters = self.ctx.resolve()?.interpreters;
        if let Some(old) = session.take_binding() {
            stop_quietly(interpreters.as_ref(), &old).await?;
        }
        let id = interpreters
            .start_interpreter(None, Some(&session.path))
            .await?;
        session.bind(id.clone());
        tracing::info!(session = %name, kernel_id = %id, "restarted interpreter");
        Ok(id)
    }

    /// Stops the session's interpreter, closes its live document and forgets
    /// it. Teardown failures are logged; the session is removed regardless.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = {
            let mut sessions = lock(&self.sessions);
            let session = sessions
                .by_name
                .remove(name)
                .ok_or_else(|| unknown_session(name))?;
            if sessions.active.as_deref() == Some(name) {
                sessions.active = None;
            }
            session
        };

        if let Some(id) = session.take_binding() {
            match self.ctx.resolve() {
                Ok(backend) => {
                    if let Err(e) = stop_quietly(backend.interpreters.as_ref(), &id).await {
                        tracing::warn!(session = %name, kernel_id = %id, error = %e, "failed to stop interpreter");
                    }
                }
                Err(e) => tracing::warn!(session = %name, error = %e, "no backend to stop interpreter"),
            }
        }
        if let Some(live) = session.live() {
            if let Err(e) = live.close().await {
                tracing::warn!(session = %name, error = %e, "failed to close live document");
            }
        }
        tracing::info!(session = %name, "disconnected notebook");
        Ok(())
    }

    /// Every session with its interpreter's state. Each probe is bounded by
    /// the configured liveness timeout; one that doesn't answer in time
    /// reports `unknown`.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let (sessions, active) = {
            let sessions = lock(&self.sessions);
            let all: Vec<Arc<Session>> = sessions.by_name.values().cloned().collect();
            (all, sessions.active.clone())
        };
        if sessions.is_empty() {
            return Ok(Vec::new());
        }
        let states = join_all(sessions.iter().map(|s| self.probe(s))).await;
        Ok(sessions
            .iter()
            .zip(states)
            .map(|(session, state)| SessionInfo {
                name: session.name.clone(),
                path: session.path.clone(),
                active: active.as_deref() == Some(session.name.as_str()),
                interpreter_id: session.interpreter_id(),
                state,
                documents: session.documents,
                live: session.live().is_some(),
            })
            .collect())
    }

    async fn probe(&self, session: &Session) -> InterpreterState {
        let binding = lock(&session.binding).clone();
        let Some(binding) = binding else {
            return InterpreterState::Unknown;
        };
        if binding.dead {
            return InterpreterState::Dead;
        }
        let Ok(backend) = self.ctx.resolve() else {
            return InterpreterState::Unknown;
        };
        let limit = self.ctx.config().execution.liveness_probe();
        match tokio::time::timeout(limit, backend.interpreters.interpreter_state(&binding.id)).await
        {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                tracing::debug!(session = %session.name, error = %e, "liveness probe failed");
                InterpreterState::Unknown
            }
            Err(_) => {
                tracing::debug!(session = %session.name, "liveness probe timed out");
                InterpreterState::Unknown
            }
        }
    }

    /// Probes every binding and marks the ones found dead.
    pub async fn refresh_liveness(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).by_name.values().cloned().collect();
        for session in sessions {
            if self.probe(&session).await == InterpreterState::Dead {
                self.mark_dead(&session);
            }
        }
    }

    /// Records that the bound interpreter died so the next execution starts
    /// a new one.
    pub fn mark_dead(&self, session: &Session) {
        if let Some(binding) = lock(&session.binding).as_mut() {
            if !binding.dead {
                tracing::warn!(session = %session.name, kernel_id = %binding.id, "interpreter died");
                binding.dead = true;
            }
        }
    }

    /// The session's interpreter id, starting a replacement when the binding
    /// is missing or dead.
    pub async fn ensure_interpreter(&self, session: &Session) -> Result<String> {
        let _lifecycle = self.lifecycle.lock().await;
        let interpreters = self.ctx.resolve()?.interpreters;
        let binding = lock(&session.binding).clone();
        match binding {
            Some(Binding { id, dead: false }) => {
                if interpreters.interpreter_state(&id).await?.is_alive() {
                    return Ok(id);
                }
                stop_quietly(interpreters.as_ref(), &id).await?;
            }
            Some(Binding { id, dead: true }) => stop_quietly(interpreters.as_ref(), &id).await?,
            None => {}
        }
        let id = interpreters
            .start_interpreter(None, Some(&session.path))
            .await?;
        session.bind(id.clone());
        tracing::info!(session = %session.name, kernel_id = %id, "started replacement interpreter");
        Ok(id)
    }
}

/// Stops an interpreter, treating one that is already gone as stopped.
async fn stop_quietly(
    interpreters: &dyn crate::backend::InterpreterBackend,
    id: &str,
) -> Result<()> {
    match interpreters.stop_interpreter(id).await {
        Err(e) if e.kind() == crate::ErrorKind::NotFound => {
            tracing::debug!(kernel_id = %id, "interpreter already gone");
            Ok(())
        }
        other => other,
    }
}
