//! Backends resolved to a Jupyter server, played by an in-process fake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jupyter_mcp_core::test_kernel::{notebook_with, FakeHost};
use jupyter_mcp_core::{Access, Config, ErrorKind, ModeContext, NotebookTools, TimingPolicy};
use jupyter_protocol::{
    ExecuteReply, ExecutionCount, JupyterMessage, JupyterMessageContent, ReplyStatus, Status,
    StreamContent,
};
use jupyter_server_client::binary_protocol::{
    deserialize_v1, serialize_v1, KERNEL_WEBSOCKET_PROTOCOL,
};
use serde_json::{json, Value};

const HOST_CONTENTS_CALLS: [&str; 4] = [
    "contents.get",
    "contents.save",
    "contents.exists",
    "contents.list",
];

#[derive(Default)]
struct FakeServer {
    requests: AtomicUsize,
    /// Requests still to be answered with 503.
    unavailable: AtomicUsize,
    notebooks: Mutex<HashMap<String, Value>>,
    kernels: Mutex<Vec<String>>,
}

impl FakeServer {
    fn with_notebook(path: &str, notebook: Value) -> Arc<Self> {
        let server = Self::default();
        server
            .notebooks
            .lock()
            .unwrap()
            .insert(path.to_string(), notebook);
        Arc::new(server)
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn notebook(&self, path: &str) -> Option<Value> {
        self.notebooks.lock().unwrap().get(path).cloned()
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts a contents request and refuses it while `unavailable` lasts.
    fn admit(&self) -> Option<Response> {
        self.count();
        self.unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| StatusCode::SERVICE_UNAVAILABLE.into_response())
    }
}

fn model(path: &str, content: Option<&Value>) -> Value {
    json!({
        "name": path.rsplit('/').next().unwrap_or(path),
        "path": path,
        "type": "notebook",
        "format": content.map(|_| "json"),
        "content": content,
        "size": content.map_or(0, |c| c.to_string().len()),
        "last_modified": "2026-01-01T00:00:00Z",
    })
}

async fn get_contents(
    State(server): State<Arc<FakeServer>>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(refused) = server.admit() {
        return refused;
    }
    let with_content = query.get("content").is_some_and(|c| c == "1");
    match server.notebooks.lock().unwrap().get(&path) {
        Some(notebook) => Json(model(&path, with_content.then_some(notebook))).into_response(),
        None => (StatusCode::NOT_FOUND, format!("No such file: {path}")).into_response(),
    }
}

async fn put_contents(
    State(server): State<Arc<FakeServer>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(refused) = server.admit() {
        return refused;
    }
    let notebook = body["content"].clone();
    let saved = model(&path, None);
    server.notebooks.lock().unwrap().insert(path, notebook);
    Json(saved).into_response()
}

fn kernel_model(id: &str) -> Value {
    json!({"id": id, "name": "python3", "execution_state": "idle", "connections": 0})
}

async fn kernel_specs(State(server): State<Arc<FakeServer>>) -> Json<Value> {
    server.count();
    Json(json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "spec": {"display_name": "Python 3", "language": "python", "env": {}}
            }
        }
    }))
}

async fn start_kernel(State(server): State<Arc<FakeServer>>) -> Json<Value> {
    server.count();
    let mut kernels = server.kernels.lock().unwrap();
    let id = format!("remote-{}", kernels.len() + 1);
    kernels.push(id.clone());
    Json(kernel_model(&id))
}

async fn list_kernels(State(server): State<Arc<FakeServer>>) -> Json<Value> {
    server.count();
    let kernels = server.kernels.lock().unwrap();
    Json(Value::Array(kernels.iter().map(|id| kernel_model(id)).collect()))
}

async fn get_kernel(State(server): State<Arc<FakeServer>>, Path(id): Path<String>) -> Response {
    server.count();
    if server.kernels.lock().unwrap().contains(&id) {
        Json(kernel_model(&id)).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn shutdown_kernel(State(server): State<Arc<FakeServer>>, Path(id): Path<String>) -> StatusCode {
    server.count();
    server.kernels.lock().unwrap().retain(|k| *k != id);
    StatusCode::NO_CONTENT
}

async fn interrupt_kernel(State(server): State<Arc<FakeServer>>) -> StatusCode {
    server.count();
    StatusCode::NO_CONTENT
}

async fn channels(State(server): State<Arc<FakeServer>>, ws: WebSocketUpgrade) -> Response {
    server.count();
    ws.protocols([KERNEL_WEBSOCKET_PROTOCOL])
        .on_upgrade(run_kernel)
}

/// Answers every execute request by echoing its code to stdout.
async fn run_kernel(mut socket: WebSocket) {
    let mut executed = 0;
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Binary(data) = frame else {
            continue;
        };
        let Ok((_, request)) = deserialize_v1(&data) else {
            continue;
        };
        let JupyterMessageContent::ExecuteRequest(execute) = &request.content else {
            continue;
        };
        executed += 1;
        let replies: [(&str, JupyterMessage); 4] = [
            ("iopub", Status::busy().as_child_of(&request)),
            ("iopub", StreamContent::stdout(&execute.code).as_child_of(&request)),
            (
                "shell",
                ExecuteReply {
                    status: ReplyStatus::Ok,
                    execution_count: ExecutionCount::new(executed),
                    payload: vec![],
                    user_expressions: None,
                    error: None,
                }
                .as_child_of(&request),
            ),
            ("iopub", Status::idle().as_child_of(&request)),
        ];
        for (channel, reply) in replies {
            let frame = serialize_v1(&reply, channel).unwrap();
            if socket.send(WsMessage::Binary(frame.into())).await.is_err() {
                return;
            }
        }
    }
}

async fn serve(server: Arc<FakeServer>) -> String {
    let app = Router::new()
        .route("/api/contents/{*path}", get(get_contents).put(put_contents))
        .route("/api/kernelspecs", get(kernel_specs))
        .route("/api/kernels", get(list_kernels).post(start_kernel))
        .route("/api/kernels/{id}", get(get_kernel).delete(shutdown_kernel))
        .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/api/kernels/{id}/channels", get(channels))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/lab?token=secret")
}

fn remote_documents(url: &str) -> Config {
    Config {
        document: url.parse().unwrap(),
        runtime: Access::Local,
        collaboration: false,
        ..Config::default()
    }
}

fn new_tools(host: &FakeHost, config: Config) -> NotebookTools {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("jupyter_mcp_core=debug")
        .with_test_writer()
        .try_init();
    NotebookTools::new(Arc::new(ModeContext::new(config, Some(host.managers()))))
}

fn host_contents_calls(host: &FakeHost) -> usize {
    HOST_CONTENTS_CALLS.iter().map(|name| host.calls_to(name)).sum()
}

#[tokio::test]
async fn test_remote_documents_never_touch_host_contents() {
    let server = FakeServer::with_notebook("demo.ipynb", notebook_with(&[("code", "print(1)")]));
    let url = serve(server.clone()).await;
    let host = FakeHost::new();
    let tools = new_tools(&host, remote_documents(&url));

    tools
        .connect_session("demo", "demo.ipynb", false, None)
        .await
        .unwrap();
    tools.insert_cell(-1, "markdown", "# Results").await.unwrap();
    tools
        .execute_cell(0, TimingPolicy::Bounded, None, None)
        .await
        .unwrap();

    let stored = server.notebook("demo.ipynb").unwrap();
    assert_eq!(stored["cells"].as_array().unwrap().len(), 2);
    assert_eq!(stored["cells"][0]["outputs"][0]["text"], "print(1)");
    assert_eq!(stored["cells"][0]["execution_count"], 1);
    assert_eq!(stored["cells"][1]["source"], "# Results");

    assert!(server.requests() > 0);
    assert_eq!(host_contents_calls(&host), 0);
    assert_eq!(host.calls_to("rooms.open"), 0);
    assert_eq!(host.calls_to("kernels.start"), 1);
}

#[tokio::test]
async fn test_remote_mode_never_touches_host_managers() {
    let server = FakeServer::with_notebook("demo.ipynb", notebook_with(&[("code", "print(1)")]));
    let url = serve(server.clone()).await;
    let host = FakeHost::new();
    let config = Config {
        runtime: url.parse().unwrap(),
        ..remote_documents(&url)
    };
    let tools = new_tools(&host, config);

    let connected = tools
        .connect_session("demo", "demo.ipynb", false, None)
        .await
        .unwrap();
    assert!(connected.ends_with("Interpreter: remote-1"));

    let blocks = tools
        .execute_cell(0, TimingPolicy::Bounded, None, None)
        .await
        .unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].as_text(), Some("print(1)"));
    let stored = server.notebook("demo.ipynb").unwrap();
    assert_eq!(stored["cells"][0]["outputs"][0]["text"], "print(1)");

    let interpreters = tools.list_interpreters().await.unwrap();
    assert!(interpreters.contains("remote-1\tpython3\tPython 3\tpython\tidle"));

    tools.disconnect_session("demo").await.unwrap();
    assert!(server.kernels.lock().unwrap().is_empty());
    assert_eq!(host.calls().entered, 0);
}

#[tokio::test]
async fn test_local_mode_makes_no_requests() {
    let server = FakeServer::with_notebook("demo.ipynb", notebook_with(&[("code", "x")]));
    let _url = serve(server.clone()).await;
    let host = FakeHost::new().with_notebook("demo.ipynb", notebook_with(&[("code", "x")]));
    let tools = new_tools(&host, Config::default());

    tools
        .connect_session("demo", "demo.ipynb", false, None)
        .await
        .unwrap();
    tools
        .execute_cell(0, TimingPolicy::Bounded, None, None)
        .await
        .unwrap();
    tools.list_files("", None).await.unwrap();

    assert_eq!(server.requests(), 0);
    assert!(host_contents_calls(&host) > 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() {
    let server = FakeServer::with_notebook("demo.ipynb", notebook_with(&[("code", "x")]));
    let url = serve(server.clone()).await;
    let host = FakeHost::new();
    let tools = new_tools(&host, remote_documents(&url));
    tools
        .connect_session("demo", "demo.ipynb", false, None)
        .await
        .unwrap();

    server.unavailable.store(1, Ordering::SeqCst);
    let before = server.requests();
    let cells = tools.list_cells().await.unwrap();
    assert!(cells.contains('x'));
    assert_eq!(server.requests() - before, 2);

    server.unavailable.store(2, Ordering::SeqCst);
    let err = tools.list_cells().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let host = FakeHost::new();
    let tools = new_tools(&host, remote_documents(&format!("http://{addr}")));
    let err = tools
        .connect_session("demo", "demo.ipynb", true, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(tools.registry().is_empty());
    assert!(host.running_kernels().is_empty());
}

#[tokio::test]
async fn test_missing_remote_notebook() {
    let server = FakeServer::with_notebook("demo.ipynb", notebook_with(&[]));
    let url = serve(server.clone()).await;
    let host = FakeHost::new();
    let tools = new_tools(&host, remote_documents(&url));

    let err = tools
        .connect_session("other", "other.ipynb", false, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(host.running_kernels().is_empty());
}
