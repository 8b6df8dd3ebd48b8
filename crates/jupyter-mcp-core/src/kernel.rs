//! Kernel message routing shared by both backends.
//!
//! A [`KernelClient`] owns one kernel connection: the writer half behind a
//! mutex and a reader task that tracks the kernel's execution state and
//! routes every message to the execution whose `msg_id` is its parent.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use jupyter_protocol::{ExecuteRequest, JupyterMessage, JupyterMessageContent, ReplyStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::output::CellOutput;

pub type MessageSink = Pin<Box<dyn Sink<JupyterMessage, Error = anyhow::Error> + Send>>;
pub type MessageStream = BoxStream<'static, anyhow::Result<JupyterMessage>>;

const ROUTE_CAPACITY: usize = 256;

/// Both directions of a kernel connection, however it is transported.
pub struct KernelChannels {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl KernelChannels {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<JupyterMessage, Error = anyhow::Error> + Send + 'static,
        R: Stream<Item = anyhow::Result<JupyterMessage>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

impl fmt::Debug for KernelChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelChannels").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterState {
    Starting,
    Idle,
    Busy,
    Dead,
    #[default]
    Unknown,
}

impl InterpreterState {
    /// Maps a Jupyter `execution_state` string.
    pub fn from_wire(state: &str) -> Self {
        match state {
            "starting" | "restarting" | "autorestarting" => InterpreterState::Starting,
            "idle" => InterpreterState::Idle,
            "busy" => InterpreterState::Busy,
            "dead" | "terminating" => InterpreterState::Dead,
            _ => InterpreterState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterpreterState::Starting => "starting",
            InterpreterState::Idle => "idle",
            InterpreterState::Busy => "busy",
            InterpreterState::Dead => "dead",
            InterpreterState::Unknown => "unknown",
        }
    }

    pub fn is_alive(self) -> bool {
        self != InterpreterState::Dead
    }

    fn is_settled(self) -> bool {
        !matches!(self, InterpreterState::Busy | InterpreterState::Starting)
    }
}

impl fmt::Display for InterpreterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One thing that happened to an execution, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Status(InterpreterState),
    Output(CellOutput),
    ClearOutput { wait: bool },
    ExecutionCount(i64),
    Reply { ok: bool },
    /// The kernel connection ended.
    Died,
    /// The kernel was restarted or shut down underneath the execution.
    Restarted,
    /// The transport failed; the kernel may still be running.
    Disconnected,
}

/// A submitted execute request and the events routed to it. The stream
/// ends after the kernel goes idle for this request.
#[derive(Debug)]
pub struct Execution {
    pub msg_id: String,
    pub events: mpsc::Receiver<KernelEvent>,
}

fn execution_state_of(content: &JupyterMessageContent) -> Option<InterpreterState> {
    match content {
        JupyterMessageContent::Status(status) => Some(
            serde_json::to_value(&status.execution_state)
                .ok()
                .and_then(|v| v.as_str().map(InterpreterState::from_wire))
                .unwrap_or_default(),
        ),
        _ => None,
    }
}

/// Events a kernel message contributes to the execution it answers.
pub fn events_for(content: &JupyterMessageContent) -> Vec<KernelEvent> {
    if let Some(state) = execution_state_of(content) {
        return vec![KernelEvent::Status(state)];
    }
    match content {
        JupyterMessageContent::ExecuteInput(input) => {
            vec![KernelEvent::ExecutionCount(input.execution_count.0 as i64)]
        }
        JupyterMessageContent::ExecuteReply(reply) => vec![
            KernelEvent::ExecutionCount(reply.execution_count.0 as i64),
            KernelEvent::Reply {
                ok: reply.status == ReplyStatus::Ok,
            },
        ],
        JupyterMessageContent::ClearOutput(clear) => vec![KernelEvent::ClearOutput { wait: clear.wait }],
        content => CellOutput::from_content(content)
            .map(KernelEvent::Output)
            .into_iter()
            .collect(),
    }
}

struct Route {
    tx: mpsc::Sender<KernelEvent>,
    saw_busy: bool,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

fn lock(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct KernelClient {
    kernel_id: String,
    writer: tokio::sync::Mutex<MessageSink>,
    routes: Routes,
    state: Arc<watch::Sender<InterpreterState>>,
    reader: JoinHandle<()>,
}

impl fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelClient")
            .field("kernel_id", &self.kernel_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl KernelClient {
    /// Takes over `channels` and starts routing. Must be called inside a
    /// tokio runtime.
    pub fn spawn(kernel_id: impl Into<String>, channels: KernelChannels) -> Self {
        let kernel_id = kernel_id.into();
        let routes: Routes = Arc::default();
        let (state, _) = watch::channel(InterpreterState::Unknown);
        let state = Arc::new(state);
        let reader = tokio::spawn(read_loop(
            kernel_id.clone(),
            channels.stream,
            routes.clone(),
            state.clone(),
        ));
        Self {
            kernel_id,
            writer: tokio::sync::Mutex::new(channels.sink),
            routes,
            state,
            reader,
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn state(&self) -> InterpreterState {
        *self.state.borrow()
    }

    /// The reader has stopped; nothing more will be routed.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Sends an execute request. The route is registered before the request
    /// leaves so no reply can outrun it.
    pub async fn execute(&self, code: &str) -> Result<Execution> {
        if self.is_closed() {
            return Err(Error::Connection(format!(
                "kernel {} connection is closed",
                self.kernel_id
            )));
        }
        let request: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let msg_id = request.header.msg_id.clone();
        let (tx, events) = mpsc::channel(ROUTE_CAPACITY);
        lock(&self.routes).insert(msg_id.clone(), Route { tx, saw_busy: false });
        self.state.send_replace(InterpreterState::Busy);

        let sent = self.writer.lock().await.send(request).await;
        if let Err(e) = sent {
            lock(&self.routes).remove(&msg_id);
            self.state.send_replace(InterpreterState::Unknown);
            return Err(Error::Connection(format!(
                "failed to send execute request to kernel {}: {e}",
                self.kernel_id
            )));
        }
        tracing::debug!(kernel_id = %self.kernel_id, %msg_id, "execute request sent");
        Ok(Execution { msg_id, events })
    }

    /// Waits up to `max` for the kernel to leave busy/starting and returns
    /// the state it settled in, or the current state on expiry.
    pub async fn wait_idle(&self, max: Duration) -> InterpreterState {
        let mut rx = self.state.subscribe();
        let settled = match tokio::time::timeout(max, rx.wait_for(|s| s.is_settled())).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => InterpreterState::Dead,
            Err(_) => self.state(),
        };
        settled
    }

    /// Stops routing and tells every pending execution it was restarted.
    pub async fn abandon(&self) {
        self.reader.abort();
        self.state.send_replace(InterpreterState::Dead);
        let routes: Vec<Route> = lock(&self.routes).drain().map(|(_, r)| r).collect();
        for route in routes {
            let _ = route.tx.send(KernelEvent::Restarted).await;
        }
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    kernel_id: String,
    mut stream: MessageStream,
    routes: Routes,
    state: Arc<watch::Sender<InterpreterState>>,
) {
    let ending = loop {
        match stream.next().await {
            Some(Ok(msg)) => dispatch(&msg, &routes, &state).await,
            Some(Err(e)) => {
                tracing::warn!(%kernel_id, error = %e, "kernel channel failed");
                break KernelEvent::Disconnected;
            }
            None => {
                tracing::info!(%kernel_id, "kernel channel closed");
                break KernelEvent::Died;
            }
        }
    };
    state.send_replace(match ending {
        KernelEvent::Died => InterpreterState::Dead,
        _ => InterpreterState::Unknown,
    });
    let pending: Vec<Route> = lock(&routes).drain().map(|(_, r)| r).collect();
    for route in pending {
        let _ = route.tx.send(ending.clone()).await;
    }
}

async fn dispatch(msg: &JupyterMessage, routes: &Routes, state: &watch::Sender<InterpreterState>) {
    let observed = execution_state_of(&msg.content);
    if let Some(observed) = observed {
        state.send_replace(observed);
    }
    let Some(parent) = msg.parent_header.as_ref().map(|h| h.msg_id.clone()) else {
        return;
    };

    let (tx, finished) = {
        let mut routes = lock(routes);
        let Some(route) = routes.get_mut(&parent) else {
            return;
        };
        let finished = match observed {
            Some(InterpreterState::Busy) => {
                route.saw_busy = true;
                false
            }
            Some(InterpreterState::Idle) => route.saw_busy,
            _ => false,
        };
        let tx = route.tx.clone();
        if finished {
            routes.remove(&parent);
        }
        (tx, finished)
    };

    for event in events_for(&msg.content) {
        if tx.send(event).await.is_err() {
            // receiver gone; the execution was given up
            lock(routes).remove(&parent);
            return;
        }
    }
    if finished {
        tracing::debug!(msg_id = %parent, "execution finished");
    }
}

/// Connected clients by kernel id. Closed clients are replaced on the next
/// lookup.
#[derive(Debug, Default)]
pub struct KernelPool {
    clients: tokio::sync::Mutex<HashMap<String, Arc<KernelClient>>>,
}

impl KernelPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, kernel_id: &str) -> Option<Arc<KernelClient>> {
        self.clients.lock().await.get(kernel_id).cloned()
    }

    pub async fn get_or_connect<F, Fut>(&self, kernel_id: &str, connect: F) -> Result<Arc<KernelClient>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<KernelChannels>>,
    {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(kernel_id) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::debug!(%kernel_id, "replacing closed kernel connection");
        }
        let client = Arc::new(KernelClient::spawn(kernel_id, connect().await?));
        clients.insert(kernel_id.to_string(), client.clone());
        Ok(client)
    }

    /// Removes the client and abandons its pending executions.
    pub async fn evict(&self, kernel_id: &str) {
        let client = self.clients.lock().await.remove(kernel_id);
        if let Some(client) = client {
            client.abandon().await;
        }
    }

    /// Drops clients whose connection has closed; returns how many.
    pub async fn prune(&self) -> usize {
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, client| !client.is_closed());
        before - clients.len()
    }
}
