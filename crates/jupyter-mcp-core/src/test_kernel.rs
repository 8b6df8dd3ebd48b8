//! An in-process mock host for testing without a Jupyter server.
//!
//! [`FakeHost`] implements [`ContentsManager`], [`KernelManager`] and
//! [`RoomManager`] over in-memory state, so a [`ModeContext`] resolved to
//! Local runs entirely inside the test process.
//!
//! Kernels behave predictably:
//!
//! | Code | Behaviour |
//! |------|-----------|
//! | anything else | echoes the code as stdout |
//! | `1/0` | `ZeroDivisionError: division by zero`, error reply |
//! | contains `while True` | runs until interrupted, then `KeyboardInterrupt` |
//! | registered with [`FakeHost::with_response`] | replays the given [`Step`]s |
//!
//! Every manager call is counted on entry and on completion; a test can
//! assert nothing is left in flight once an operation returns.
//!
//! ```ignore
//! let host = FakeHost::new().with_notebook("demo.ipynb", empty_notebook());
//! let ctx = ModeContext::new(Config::default(), Some(host.managers()));
//! let tools = NotebookTools::new(Arc::new(ctx));
//! tools.connect_session("demo", "demo.ipynb", false, None).await?;
//! assert_eq!(host.calls().in_flight, 0);
//! ```
//!
//! [`ModeContext`]: crate::mode::ModeContext

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt as _, StreamExt as _};
use jupyter_protocol::{
    ErrorOutput, ExecuteInput, ExecuteReply, ExecutionCount, JupyterMessage, JupyterMessageContent,
    ReplyStatus, Status, StreamContent,
};
use notebook_crdt::{NotebookDoc, StateVector};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{
    ContentsManager, DocumentEntry, EntryKind, HostError, HostKernel, HostManagers, KernelManager,
    Room, RoomManager, SpecInfo,
};
use crate::kernel::KernelChannels;

type HostResult<T> = std::result::Result<T, HostError>;
type Outbound = fmpsc::UnboundedSender<anyhow::Result<JupyterMessage>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One thing a scripted execution does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Publish this content as a child of the request.
    Emit(JupyterMessageContent),
    /// Wait; an interrupt cuts the wait short with `KeyboardInterrupt`.
    Sleep(Duration),
    /// Raise an exception and reply with an error status.
    Raise { ename: String, evalue: String },
    /// Busy-loop until interrupted.
    Spin,
    /// Stop answering entirely, interrupts included.
    Hang,
    /// Exit the kernel process.
    Die,
}

impl Step {
    pub fn stdout(text: &str) -> Self {
        Step::Emit(JupyterMessageContent::StreamContent(StreamContent::stdout(text)))
    }
}

/// An empty nbformat 4.5 notebook.
pub fn empty_notebook() -> Value {
    json!({"cells": [], "metadata": {}, "nbformat": 4, "nbformat_minor": 5})
}

/// A notebook with one cell per `(cell_type, source)`.
pub fn notebook_with(cells: &[(&str, &str)]) -> Value {
    let cells: Vec<Value> = cells
        .iter()
        .enumerate()
        .map(|(i, (cell_type, source))| {
            let mut cell = json!({
                "id": format!("cell-{i}"),
                "cell_type": cell_type,
                "metadata": {},
                "source": source,
            });
            if *cell_type == "code" {
                cell["outputs"] = json!([]);
                cell["execution_count"] = Value::Null;
            }
            cell
        })
        .collect();
    json!({"cells": cells, "metadata": {}, "nbformat": 4, "nbformat_minor": 5})
}

/// Manager calls seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub entered: usize,
    pub finished: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct CallLog {
    entered: AtomicUsize,
    finished: AtomicUsize,
    names: Mutex<Vec<&'static str>>,
}

struct CallGuard<'a>(&'a CallLog);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl CallLog {
    fn enter(&self, name: &'static str) -> CallGuard<'_> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        lock(&self.names).push(name);
        CallGuard(self)
    }
}

enum Entry {
    Notebook(Value),
    File(u64),
}

struct FakeKernel {
    name: String,
    requests: fmpsc::UnboundedSender<JupyterMessage>,
    interrupts: mpsc::UnboundedSender<()>,
    outbound: Arc<Mutex<Option<Outbound>>>,
    state: Arc<Mutex<&'static str>>,
    task: JoinHandle<()>,
}

struct FakeRoom {
    path: String,
    doc: Mutex<NotebookDoc>,
    host: Arc<HostState>,
}

#[derive(Default)]
struct HostState {
    files: Mutex<BTreeMap<String, Entry>>,
    kernels: Mutex<HashMap<String, FakeKernel>>,
    rooms: Mutex<HashMap<String, Arc<FakeRoom>>>,
    script: Mutex<HashMap<String, Vec<Step>>>,
    next_kernel: AtomicUsize,
    calls: CallLog,
}

/// In-memory contents, kernels and collaboration rooms.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<HostState>,
    rooms_enabled: bool,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            rooms_enabled: true,
        }
    }

    /// A host running without real-time collaboration.
    pub fn without_rooms(mut self) -> Self {
        self.rooms_enabled = false;
        self
    }

    pub fn with_notebook(self, path: &str, notebook: Value) -> Self {
        lock(&self.state.files).insert(path.to_string(), Entry::Notebook(notebook));
        self
    }

    pub fn with_file(self, path: &str, size: u64) -> Self {
        lock(&self.state.files).insert(path.to_string(), Entry::File(size));
        self
    }

    /// Replays `steps` whenever exactly `code` is executed.
    pub fn with_response(self, code: &str, steps: Vec<Step>) -> Self {
        lock(&self.state.script).insert(code.to_string(), steps);
        self
    }

    pub fn managers(&self) -> HostManagers {
        HostManagers {
            contents: Arc::new(self.clone()),
            kernels: Arc::new(self.clone()),
            rooms: self
                .rooms_enabled
                .then(|| Arc::new(self.clone()) as Arc<dyn RoomManager>),
        }
    }

    /// Notebook JSON as currently stored.
    pub fn notebook(&self, path: &str) -> Option<Value> {
        match lock(&self.state.files).get(path) {
            Some(Entry::Notebook(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn calls(&self) -> CallCounts {
        let entered = self.state.calls.entered.load(Ordering::SeqCst);
        let finished = self.state.calls.finished.load(Ordering::SeqCst);
        CallCounts {
            entered,
            finished,
            in_flight: entered.saturating_sub(finished),
        }
    }

    /// How many times the named manager method has been called.
    pub fn calls_to(&self, name: &str) -> usize {
        lock(&self.state.calls.names)
            .iter()
            .filter(|n| **n == name)
            .count()
    }

    pub fn running_kernels(&self) -> Vec<String> {
        let kernels = lock(&self.state.kernels);
        let mut ids: Vec<String> = kernels
            .iter()
            .filter(|(_, k)| *lock(&k.state) != "dead")
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn not_found(path: &str) -> HostError {
    HostError::NotFound(path.to_string())
}

#[async_trait]
impl ContentsManager for FakeHost {
    async fn get(&self, path: &str) -> HostResult<Value> {
        let _call = self.state.calls.enter("contents.get");
        tokio::task::yield_now().await;
        self.notebook(path).ok_or_else(|| not_found(path))
    }

    async fn save(&self, path: &str, notebook: Value) -> HostResult<()> {
        let _call = self.state.calls.enter("contents.save");
        tokio::task::yield_now().await;
        lock(&self.state.files).insert(path.to_string(), Entry::Notebook(notebook));
        Ok(())
    }

    async fn exists(&self, path: &str) -> HostResult<bool> {
        let _call = self.state.calls.enter("contents.exists");
        Ok(lock(&self.state.files).contains_key(path))
    }

    async fn list(&self, path: &str) -> HostResult<Vec<DocumentEntry>> {
        let _call = self.state.calls.enter("contents.list");
        let path = path.trim_matches('/');
        let files = lock(&self.state.files);
        let mut entries: BTreeMap<String, DocumentEntry> = BTreeMap::new();
        for (file, entry) in files.iter() {
            let Some(rest) = (if path.is_empty() {
                Some(file.as_str())
            } else {
                file.strip_prefix(path).and_then(|r| r.strip_prefix('/'))
            }) else {
                continue;
            };
            let listed = match rest.split_once('/') {
                Some((dir, _)) => DocumentEntry {
                    path: join(path, dir),
                    kind: EntryKind::Directory,
                    size: None,
                    last_modified: None,
                },
                None => DocumentEntry {
                    path: file.clone(),
                    kind: match entry {
                        Entry::Notebook(_) => EntryKind::Notebook,
                        Entry::File(_) => EntryKind::File,
                    },
                    size: Some(match entry {
                        Entry::Notebook(value) => value.to_string().len() as u64,
                        Entry::File(size) => *size,
                    }),
                    last_modified: Some("2026-01-01T00:00:00Z".into()),
                },
            };
            entries.insert(listed.path.clone(), listed);
        }
        if entries.is_empty() && !path.is_empty() {
            return Err(not_found(path));
        }
        Ok(entries.into_values().collect())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// The kernel process: reads requests one at a time and writes replies and
/// iopub traffic to whichever connection is current.
struct KernelRuntime {
    requests: fmpsc::UnboundedReceiver<JupyterMessage>,
    interrupts: mpsc::UnboundedReceiver<()>,
    outbound: Arc<Mutex<Option<Outbound>>>,
    state: Arc<Mutex<&'static str>>,
    host: Arc<HostState>,
    execution_count: usize,
}

enum Flow {
    Continue,
    Exit,
}

impl KernelRuntime {
    async fn run(mut self) {
        while let Some(request) = self.requests.next().await {
            let JupyterMessageContent::ExecuteRequest(req) = &request.content else {
                continue;
            };
            let code = req.code.clone();
            if let Flow::Exit = self.execute(&request, &code).await {
                break;
            }
        }
        *lock(&self.state) = "dead";
        lock(&self.outbound).take();
    }

    fn emit(&self, msg: JupyterMessage) {
        if let Some(tx) = lock(&self.outbound).as_ref() {
            let _ = tx.unbounded_send(Ok(msg));
        }
    }

    fn child(&self, content: JupyterMessageContent, parent: &JupyterMessage) {
        self.emit(JupyterMessage::new(content, Some(parent)));
    }

    fn raise(&self, parent: &JupyterMessage, ename: &str, evalue: &str) {
        self.child(
            JupyterMessageContent::ErrorOutput(ErrorOutput {
                ename: ename.to_string(),
                evalue: evalue.to_string(),
                traceback: vec![format!("\x1b[0;31m{ename}\x1b[0m: {evalue}")],
            }),
            parent,
        );
    }

    fn steps_for(&self, code: &str) -> Vec<Step> {
        if let Some(steps) = lock(&self.host.script).get(code) {
            return steps.clone();
        }
        if code.trim() == "1/0" {
            vec![Step::Raise {
                ename: "ZeroDivisionError".into(),
                evalue: "division by zero".into(),
            }]
        } else if code.contains("while True") {
            vec![Step::Spin]
        } else {
            vec![Step::stdout(code)]
        }
    }

    async fn execute(&mut self, parent: &JupyterMessage, code: &str) -> Flow {
        // interrupts sent while idle are dropped
        while self.interrupts.try_recv().is_ok() {}

        *lock(&self.state) = "busy";
        self.emit(Status::busy().as_child_of(parent));
        self.execution_count += 1;
        let count = ExecutionCount::new(self.execution_count);
        self.emit(
            ExecuteInput {
                code: code.to_string(),
                execution_count: count,
            }
            .as_child_of(parent),
        );

        let mut ok = true;
        for step in self.steps_for(code) {
            match step {
                Step::Emit(content) => self.child(content, parent),
                Step::Sleep(duration) => {
                    let interrupted = tokio::select! {
                        _ = tokio::time::sleep(duration) => false,
                        _ = self.interrupts.recv() => true,
                    };
                    if interrupted {
                        self.raise(parent, "KeyboardInterrupt", "");
                        ok = false;
                        break;
                    }
                }
                Step::Raise { ename, evalue } => {
                    self.raise(parent, &ename, &evalue);
                    ok = false;
                }
                Step::Spin => {
                    let _ = self.interrupts.recv().await;
                    self.raise(parent, "KeyboardInterrupt", "");
                    ok = false;
                    break;
                }
                Step::Hang => std::future::pending::<()>().await,
                Step::Die => return Flow::Exit,
            }
        }

        self.emit(
            ExecuteReply {
                status: if ok { ReplyStatus::Ok } else { ReplyStatus::Error },
                execution_count: count,
                payload: vec![],
                user_expressions: None,
                error: None,
            }
            .as_child_of(parent),
        );
        self.emit(Status::idle().as_child_of(parent));
        *lock(&self.state) = "idle";
        Flow::Continue
    }
}

fn python_spec() -> SpecInfo {
    SpecInfo {
        name: "python3".into(),
        display_name: "Python 3 (ipykernel)".into(),
        language: "python".into(),
        env: HashMap::new(),
    }
}

#[async_trait]
impl KernelManager for FakeHost {
    async fn start(&self, spec: Option<&str>, _path: Option<&str>) -> HostResult<String> {
        let _call = self.state.calls.enter("kernels.start");
        let n = self.state.next_kernel.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("kernel-{n}");
        let (requests, requests_rx) = fmpsc::unbounded();
        let (interrupts, interrupts_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(Mutex::new(None));
        let state = Arc::new(Mutex::new("idle"));
        let runtime = KernelRuntime {
            requests: requests_rx,
            interrupts: interrupts_rx,
            outbound: outbound.clone(),
            state: state.clone(),
            host: self.state.clone(),
            execution_count: 0,
        };
        let kernel = FakeKernel {
            name: spec.unwrap_or("python3").to_string(),
            requests,
            interrupts,
            outbound,
            state,
            task: tokio::spawn(runtime.run()),
        };
        lock(&self.state.kernels).insert(id.clone(), kernel);
        Ok(id)
    }

    async fn shutdown(&self, id: &str) -> HostResult<()> {
        let _call = self.state.calls.enter("kernels.shutdown");
        let kernel = lock(&self.state.kernels)
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        kernel.task.abort();
        lock(&kernel.outbound).take();
        Ok(())
    }

    async fn interrupt(&self, id: &str) -> HostResult<()> {
        let _call = self.state.calls.enter("kernels.interrupt");
        let kernels = lock(&self.state.kernels);
        let kernel = kernels.get(id).ok_or_else(|| not_found(id))?;
        let _ = kernel.interrupts.send(());
        Ok(())
    }

    async fn get(&self, id: &str) -> HostResult<Option<HostKernel>> {
        let _call = self.state.calls.enter("kernels.get");
        Ok(lock(&self.state.kernels).get(id).map(|k| HostKernel {
            id: id.to_string(),
            name: k.name.clone(),
            execution_state: lock(&k.state).to_string(),
            connections: Some(u64::from(lock(&k.outbound).is_some())),
            last_activity: None,
        }))
    }

    async fn list(&self) -> HostResult<Vec<HostKernel>> {
        let _call = self.state.calls.enter("kernels.list");
        let kernels = lock(&self.state.kernels);
        let mut listed: Vec<HostKernel> = kernels
            .iter()
            .map(|(id, k)| HostKernel {
                id: id.clone(),
                name: k.name.clone(),
                execution_state: lock(&k.state).to_string(),
                connections: Some(u64::from(lock(&k.outbound).is_some())),
                last_activity: None,
            })
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    async fn specs(&self) -> HostResult<Vec<SpecInfo>> {
        let _call = self.state.calls.enter("kernels.specs");
        Ok(vec![python_spec()])
    }

    async fn connect(&self, id: &str) -> HostResult<KernelChannels> {
        let _call = self.state.calls.enter("kernels.connect");
        let kernels = lock(&self.state.kernels);
        let kernel = kernels.get(id).ok_or_else(|| not_found(id))?;
        if *lock(&kernel.state) == "dead" {
            return Err(HostError::Disconnected(format!("kernel {id} is dead")));
        }
        let (tx, rx) = fmpsc::unbounded();
        *lock(&kernel.outbound) = Some(tx);
        let sink = kernel.requests.clone().sink_map_err(anyhow::Error::from);
        Ok(KernelChannels::new(sink, rx))
    }
}

impl FakeRoom {
    fn persist(&self, doc: &NotebookDoc) {
        lock(&self.host.files).insert(self.path.clone(), Entry::Notebook(doc.to_json()));
    }
}

#[async_trait]
impl Room for FakeRoom {
    async fn apply_update(&self, update: &[u8]) -> HostResult<()> {
        let _call = self.host.calls.enter("room.apply_update");
        let doc = lock(&self.doc);
        doc.apply_update(update)
            .map_err(|e| HostError::Failed(e.to_string()))?;
        self.persist(&doc);
        Ok(())
    }

    async fn encode_diff(&self, since: &StateVector) -> HostResult<Vec<u8>> {
        let _call = self.host.calls.enter("room.encode_diff");
        Ok(lock(&self.doc).encode_diff(since))
    }
}

#[async_trait]
impl RoomManager for FakeHost {
    async fn open(&self, path: &str) -> HostResult<Arc<dyn Room>> {
        let _call = self.state.calls.enter("rooms.open");
        if let Some(room) = lock(&self.state.rooms).get(path) {
            return Ok(room.clone());
        }
        let notebook = self.notebook(path).ok_or_else(|| not_found(path))?;
        let doc = NotebookDoc::from_notebook_json(&notebook)
            .map_err(|e| HostError::Failed(e.to_string()))?;
        let room = Arc::new(FakeRoom {
            path: path.to_string(),
            doc: Mutex::new(doc),
            host: self.state.clone(),
        });
        lock(&self.state.rooms).insert(path.to_string(), room.clone());
        Ok(room)
    }
}
