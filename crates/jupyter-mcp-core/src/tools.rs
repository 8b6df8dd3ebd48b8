//! One method per tool call, each producing the text or content blocks the
//! agent sees. Every call goes through [`SafeOperation`].

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{DocumentBackend, EntryKind, InterpreterInfo};
use crate::config::Config;
use crate::engine::{ExecutionEngine, ExecutionOutcome, ExecutionRequest, ExecutionStatus, TimingPolicy};
use crate::error::{Error, Result};
use crate::mode::ModeContext;
use crate::notebook::{cell_position, Cell, CellType, Notebook};
use crate::output::{render, render_all, CellOutput, ContentBlock};
use crate::registry::{Session, SessionRegistry};
use crate::safe::SafeOperation;

pub type ToolOutput = Vec<ContentBlock>;

const LIST_RULE_WIDTH: usize = 60;
const FIRST_LINE_MAX: usize = 50;
const ENV_MAX: usize = 100;
const SURROUNDING: usize = 5;
const DIFF_CONTEXT: usize = 3;
pub const DEFAULT_LIST_DEPTH: usize = 3;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max - 3).collect();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

fn count_column(cell: &Cell) -> String {
    match cell {
        Cell::Code {
            execution_count: Some(n),
            ..
        } => n.to_string(),
        Cell::Code { .. } => "None".into(),
        _ => "N/A".into(),
    }
}

fn cell_row(index: usize, cell: &Cell) -> String {
    format!(
        "{index}\t{}\t{}\t{}",
        cell.cell_type(),
        count_column(cell),
        truncate(cell.first_line(), FIRST_LINE_MAX)
    )
}

fn cell_table(rows: impl Iterator<Item = String>) -> String {
    let mut lines = vec!["Index\tType\tCount\tFirst Line".to_string(), "-".repeat(LIST_RULE_WIDTH)];
    lines.extend(rows);
    lines.join("\n")
}

fn format_size(kind: EntryKind, size: Option<u64>) -> String {
    match (kind, size) {
        (EntryKind::Directory, _) | (_, None) => String::new(),
        (_, Some(n)) if n < 1024 => format!("{n}B"),
        (_, Some(n)) if n < 1024 * 1024 => format!("{:.1}KB", n as f64 / 1024.0),
        (_, Some(n)) => format!("{:.1}MB", n as f64 / (1024.0 * 1024.0)),
    }
}

fn format_env(info: &InterpreterInfo) -> String {
    let Some(spec) = &info.spec else {
        return "unknown".into();
    };
    if spec.env.is_empty() {
        return "unknown".into();
    }
    let mut pairs: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    let joined = pairs.join("; ");
    if joined.chars().count() > ENV_MAX {
        let kept: String = joined.chars().take(ENV_MAX).collect();
        format!("{kept}...")
    } else {
        joined
    }
}

fn interpreter_row(info: &InterpreterInfo) -> String {
    let (display_name, language) = match &info.spec {
        Some(spec) => (spec.display_name.as_str(), spec.language.as_str()),
        None => ("unknown", "unknown"),
    };
    [
        info.id.clone(),
        info.name.clone(),
        display_name.to_string(),
        language.to_string(),
        info.state.to_string(),
        info.connections
            .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
        info.last_activity.clone().unwrap_or_else(|| "unknown".into()),
        format_env(info),
    ]
    .join("\t")
}

fn status_marker(outcome: &ExecutionOutcome) -> Option<String> {
    match &outcome.status {
        ExecutionStatus::Completed => None,
        ExecutionStatus::TimedOut => Some(format!(
            "[TIMEOUT ERROR: Execution exceeded {} seconds]",
            outcome.timeout.as_secs()
        )),
        ExecutionStatus::Interrupted => Some(format!(
            "[INTERRUPTED after {:.1}s]",
            outcome.elapsed.as_secs_f64()
        )),
        ExecutionStatus::Errored(_) => Some("[ERROR: interpreter died during execution]".into()),
    }
}

/// Outputs followed by the terminal marker, if any.
pub fn render_outcome(outcome: &ExecutionOutcome, allow_images: bool) -> ToolOutput {
    let mut blocks = render_all(&outcome.outputs, allow_images);
    match status_marker(outcome) {
        Some(marker) => blocks.push(ContentBlock::text(marker)),
        None if blocks.is_empty() => blocks.push(ContentBlock::text("[No output generated]")),
        None => {}
    }
    blocks
}

fn push_timed(blocks: &mut ToolOutput, elapsed: Duration, output: &CellOutput, allow_images: bool) {
    match render(output, allow_images) {
        ContentBlock::Text { text } if text.is_empty() => {}
        ContentBlock::Text { text } => blocks.push(ContentBlock::text(format!(
            "[{:.1}s] {text}",
            elapsed.as_secs_f64()
        ))),
        image => blocks.push(image),
    }
}

/// A progress log: outputs stamped with when they were first seen, a line
/// per progress tick, then the terminal line.
pub fn render_progress_log(outcome: &ExecutionOutcome, allow_images: bool) -> ToolOutput {
    let mut blocks = Vec::new();
    let mut shown = 0;
    for snapshot in &outcome.progress {
        for output in snapshot.new_outputs() {
            push_timed(&mut blocks, snapshot.elapsed, output, allow_images);
            shown += 1;
        }
        blocks.push(ContentBlock::text(format!(
            "[PROGRESS: {:.1}s elapsed, {} outputs so far]",
            snapshot.elapsed.as_secs_f64(),
            snapshot.outputs.len()
        )));
    }
    let tail_from = match outcome.progress.last() {
        Some(last) if outcome.outputs.starts_with(&last.outputs) => last.outputs.len(),
        _ => 0,
    };
    for output in &outcome.outputs[tail_from..] {
        push_timed(&mut blocks, outcome.elapsed, output, allow_images);
        shown += 1;
    }
    if shown == 0 {
        blocks.push(ContentBlock::text("[No output generated]"));
    }
    blocks.push(ContentBlock::text(status_marker(outcome).unwrap_or_else(|| {
        format!("[COMPLETED in {:.1}s]", outcome.elapsed.as_secs_f64())
    })));
    blocks
}

/// The tool-call surface over a [`SessionRegistry`] and [`ExecutionEngine`].
#[derive(Debug, Clone)]
pub struct NotebookTools {
    registry: Arc<SessionRegistry>,
    engine: ExecutionEngine,
    safe: SafeOperation,
}

impl NotebookTools {
    pub fn new(ctx: Arc<ModeContext>) -> Self {
        let registry = Arc::new(SessionRegistry::new(ctx));
        Self {
            engine: ExecutionEngine::new(registry.clone()),
            safe: SafeOperation::new(registry.clone()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn config(&self) -> &Config {
        self.registry.context().config()
    }

    fn documents(&self) -> Result<Arc<dyn DocumentBackend>> {
        Ok(self.registry.context().resolve()?.documents)
    }

    async fn active_notebook(&self) -> Result<(Arc<Session>, Notebook)> {
        let session = self.registry.active()?;
        let notebook = session.read(self.documents()?.as_ref()).await?;
        Ok((session, notebook))
    }

    /// Connects the notebook named by `document_id` as session `default`.
    /// Returns `None` when no document is configured.
    pub async fn connect_default(&self) -> Result<Option<String>> {
        let config = self.config();
        let Some(path) = config.document_id.clone() else {
            return Ok(None);
        };
        let reuse = if config.start_new_runtime {
            None
        } else {
            config.runtime_id.clone()
        };
        if let Some(id) = reuse.as_deref() {
            let backend = self.registry.context().resolve()?;
            let interpreters = backend.interpreters.as_ref();
            let state = self
                .safe
                .run("probe_runtime", move || interpreters.interpreter_state(id))
                .await?;
            if !state.is_alive() {
                return Err(Error::Configuration(format!(
                    "RUNTIME_ID {id} is {state} and START_NEW_RUNTIME is off"
                )));
            }
        }
        self.connect_session("default", &path, true, reuse.as_deref())
            .await
            .map(Some)
    }

    pub async fn connect_session(
        &self,
        name: &str,
        path: &str,
        create: bool,
        interpreter_id: Option<&str>,
    ) -> Result<String> {
        self.safe
            .run("connect_session", move || {
                self.connect_inner(name, path, create, interpreter_id)
            })
            .await
    }

    async fn connect_inner(
        &self,
        name: &str,
        path: &str,
        create: bool,
        interpreter_id: Option<&str>,
    ) -> Result<String> {
        let connected = self
            .registry
            .connect(name, path, create, interpreter_id)
            .await?;
        let head = if connected.existing {
            format!("Notebook '{name}' is already connected to '{path}'.")
        } else if connected.created {
            format!("Successfully created and connected to notebook '{name}' at path '{path}'.")
        } else {
            format!("Successfully connected to notebook '{name}' at path '{path}'.")
        };
        let interpreter = connected
            .session
            .interpreter_id()
            .unwrap_or_else(|| "none".into());
        Ok(format!("{head}\nInterpreter: {interpreter}"))
    }

    pub async fn list_sessions(&self) -> Result<String> {
        self.safe
            .run("list_sessions", move || async move {
                let sessions = self.registry.list().await?;
                if sessions.is_empty() {
                    return Ok("No notebooks are currently connected.".to_string());
                }
                let mut lines = vec!["Name\tPath\tActive\tInterpreter\tState".to_string()];
                lines.extend(sessions.iter().map(|s| {
                    format!(
                        "{}\t{}\t{}\t{}\t{}",
                        s.name,
                        s.path,
                        if s.active { "✓" } else { "" },
                        s.interpreter_id.as_deref().unwrap_or("none"),
                        s.state
                    )
                }));
                Ok(lines.join("\n"))
            })
            .await
    }

    pub async fn switch_session(&self, name: &str) -> Result<String> {
        self.registry.switch(name)?;
        Ok(format!("Successfully switched to notebook '{name}'."))
    }

    pub async fn restart_session(&self, name: &str) -> Result<String> {
        self.safe
            .run("restart_session", move || async move {
                self.registry.restart(name).await?;
                Ok(format!(
                    "Notebook '{name}' kernel restarted successfully. Memory state and imported packages have been cleared."
                ))
            })
            .await
    }

    pub async fn disconnect_session(&self, name: &str) -> Result<String> {
        self.safe
            .run("disconnect_session", move || async move {
                self.registry.disconnect(name).await?;
                Ok(format!("Notebook '{name}' disconnected successfully."))
            })
            .await
    }

    pub async fn list_cells(&self) -> Result<String> {
        self.safe
            .run("list_cells", move || async move {
                let (_, notebook) = self.active_notebook().await?;
                if notebook.is_empty() {
                    return Ok("Notebook is empty, no cells found.".to_string());
                }
                Ok(cell_table(
                    notebook.cells.iter().enumerate().map(|(i, c)| cell_row(i, c)),
                ))
            })
            .await
    }

    fn cell_blocks(&self, index: usize, cell: &Cell) -> ToolOutput {
        let mut blocks = vec![ContentBlock::text(format!(
            "=====Cell {index} | type: {} | execution count: {}=====\n{}",
            cell.cell_type(),
            count_column(cell),
            cell.source()
        ))];
        blocks.extend(render_all(cell.outputs(), self.config().allow_img_output));
        blocks
    }

    pub async fn read_cell(&self, index: i64) -> Result<ToolOutput> {
        self.safe
            .run("read_cell", move || async move {
                let (_, notebook) = self.active_notebook().await?;
                let at = cell_position(index, notebook.len())?;
                Ok(self.cell_blocks(at, &notebook.cells[at]))
            })
            .await
    }

    /// Every cell, or those in `range` (clamped to the notebook).
    pub async fn read_cells(&self, range: Option<Range<usize>>) -> Result<ToolOutput> {
        let range = &range;
        self.safe
            .run("read_cells", move || async move {
                let (_, notebook) = self.active_notebook().await?;
                let len = notebook.len();
                let (start, end) = match range {
                    Some(r) => (r.start.min(len), r.end.min(len)),
                    None => (0, len),
                };
                Ok(notebook.cells[start..end.max(start)]
                    .iter()
                    .enumerate()
                    .flat_map(|(offset, cell)| self.cell_blocks(start + offset, cell))
                    .collect())
            })
            .await
    }

    pub async fn notebook_info(&self) -> Result<String> {
        self.safe
            .run("notebook_info", move || async move {
                let (session, notebook) = self.active_notebook().await?;
                let counts: Vec<String> = notebook
                    .type_counts()
                    .iter()
                    .map(|(kind, n)| format!("{kind}={n}"))
                    .collect();
                Ok(format!(
                    "Notebook: {}\nPath: {}\nTotal cells: {}\nCell types: {}",
                    session.name(),
                    session.path(),
                    notebook.len(),
                    counts.join(", ")
                ))
            })
            .await
    }

    pub async fn insert_cell(&self, index: i64, cell_type: &str, source: &str) -> Result<String> {
        let cell_type: CellType = cell_type.parse()?;
        self.safe
            .run("insert_cell", move || async move {
                let session = self.registry.active()?;
                let documents = self.documents()?;
                let at = session
                    .insert_cell(documents.as_ref(), index, cell_type, source)
                    .await?;
                let notebook = session.read(documents.as_ref()).await?;
                let start = at.saturating_sub(SURROUNDING);
                let end = (at + SURROUNDING + 1).min(notebook.len());
                let rows = notebook.cells[start..end]
                    .iter()
                    .enumerate()
                    .map(|(offset, cell)| {
                        let i = start + offset;
                        let row = cell_row(i, cell);
                        if i == at {
                            format!("{row} ← inserted")
                        } else {
                            row
                        }
                    });
                Ok(format!(
                    "Cell inserted successfully at index {at} ({cell_type})!\n\nCurrent Surrounding Cells:\n{}",
                    cell_table(rows)
                ))
            })
            .await
    }

    pub async fn overwrite_cell_source(&self, index: i64, source: &str) -> Result<String> {
        self.safe
            .run("overwrite_cell_source", move || async move {
                let session = self.registry.active()?;
                let old = session
                    .set_source(self.documents()?.as_ref(), index, source)
                    .await?;
                let diff = crate::diff::unified_diff(&old, source, DIFF_CONTEXT);
                if diff.is_empty() {
                    Ok(format!("Cell {index} overwritten successfully - no changes detected."))
                } else {
                    Ok(format!(
                        "Cell {index} overwritten successfully!\n\n```diff\n{diff}\n```"
                    ))
                }
            })
            .await
    }

    pub async fn delete_cell(&self, index: i64) -> Result<String> {
        self.safe
            .run("delete_cell", move || async move {
                let session = self.registry.active()?;
                let removed = session
                    .delete_cell(self.documents()?.as_ref(), index)
                    .await?;
                Ok(format!(
                    "Cell {index} ({}) deleted successfully.",
                    removed.cell_type()
                ))
            })
            .await
    }

    async fn run(&self, request: impl Fn() -> ExecutionRequest) -> Result<ExecutionOutcome> {
        let request = &request;
        self.safe
            .run("execute", move || async move {
                let session = self.registry.active()?;
                self.engine.execute(&session, request()).await
            })
            .await
    }

    /// Runs a code cell under `policy`. Bounded runs return the outputs;
    /// the progress policies return a timestamped log.
    pub async fn execute_cell(
        &self,
        index: i64,
        policy: TimingPolicy,
        timeout: Option<Duration>,
        progress_interval: Option<Duration>,
    ) -> Result<ToolOutput> {
        let outcome = self
            .run(|| {
                let mut request = ExecutionRequest::cell(index).with_policy(policy);
                request.timeout = timeout;
                request.progress_interval = progress_interval;
                request
            })
            .await?;
        let allow_images = self.config().allow_img_output;
        Ok(match policy {
            TimingPolicy::Bounded => render_outcome(&outcome, allow_images),
            TimingPolicy::Streaming | TimingPolicy::ForcedSync => {
                render_progress_log(&outcome, allow_images)
            }
        })
    }

    /// Inserts a code cell and runs it.
    pub async fn insert_execute_cell(
        &self,
        index: i64,
        source: &str,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        let at = self
            .safe
            .run("insert_cell", move || async move {
                let session = self.registry.active()?;
                session
                    .insert_cell(self.documents()?.as_ref(), index, CellType::Code, source)
                    .await
            })
            .await?;
        let outcome = self
            .run(|| {
                let mut request = ExecutionRequest::cell(at as i64);
                request.timeout = timeout;
                request
            })
            .await?;
        Ok(render_outcome(&outcome, self.config().allow_img_output))
    }

    /// Runs code on the active session's interpreter without touching the
    /// notebook.
    pub async fn execute_code(&self, code: &str, timeout: Option<Duration>) -> Result<ToolOutput> {
        let outcome = self
            .run(|| {
                let mut request = ExecutionRequest::code(code);
                request.timeout = timeout;
                request
            })
            .await?;
        Ok(render_outcome(&outcome, self.config().allow_img_output))
    }

    pub async fn list_interpreters(&self) -> Result<String> {
        self.safe
            .run("list_interpreters", move || async move {
                let interpreters = self.registry.context().resolve()?.interpreters;
                let listed = interpreters.list_interpreters().await?;
                if listed.is_empty() {
                    return Ok("No kernels found".to_string());
                }
                let mut lines = vec![
                    "ID\tName\tDisplay_Name\tLanguage\tState\tConnections\tLast_Activity\tEnvironment"
                        .to_string(),
                ];
                lines.extend(listed.iter().map(interpreter_row));
                Ok(lines.join("\n"))
            })
            .await
    }

    /// Files under `path`, recursing into directories down to `max_depth`.
    pub async fn list_files(&self, path: &str, max_depth: Option<usize>) -> Result<String> {
        let depth = max_depth.unwrap_or(DEFAULT_LIST_DEPTH);
        self.safe
            .run("list_files", move || async move {
                let entries = self
                    .documents()?
                    .list_documents(path, true, depth)
                    .await?;
                if entries.is_empty() {
                    return Ok(format!("No files found in path '{path}'."));
                }
                let mut lines = vec!["Path\tType\tSize\tLast_Modified".to_string()];
                lines.extend(entries.iter().map(|e| {
                    format!(
                        "{}\t{}\t{}\t{}",
                        e.path,
                        e.kind.as_str(),
                        format_size(e.kind, e.size),
                        e.last_modified.as_deref().unwrap_or("N/A")
                    )
                }));
                Ok(lines.join("\n"))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::backend::SpecInfo;
    use crate::engine::ProgressSnapshot;
    use crate::kernel::InterpreterState;

    #[test]
    fn test_first_line_truncation() {
        let long = "x".repeat(60);
        let shown = truncate(&long, FIRST_LINE_MAX);
        assert_eq!(shown.len(), 50);
        assert!(shown.ends_with("..."));
        assert_eq!(truncate("short", FIRST_LINE_MAX), "short");
    }

    #[test]
    fn test_cell_rows() {
        let mut code = Cell::new(CellType::Code, "import os\nos.getcwd()");
        assert_eq!(cell_row(0, &code), "0\tcode\tNone\timport os");
        code.set_outputs(vec![], Some(4));
        assert_eq!(cell_row(2, &code), "2\tcode\t4\timport os");
        assert_eq!(cell_row(1, &Cell::new(CellType::Markdown, "# T")), "1\tmarkdown\tN/A\t# T");
    }

    #[test]
    fn test_sizes() {
        assert_eq!(format_size(EntryKind::File, Some(512)), "512B");
        assert_eq!(format_size(EntryKind::File, Some(2048)), "2.0KB");
        assert_eq!(format_size(EntryKind::Notebook, Some(3 * 1024 * 1024)), "3.0MB");
        assert_eq!(format_size(EntryKind::Directory, Some(4096)), "");
    }

    #[test]
    fn test_interpreter_row_env_and_unknowns() {
        let env: HashMap<String, String> = (0..20)
            .map(|i| (format!("VAR{i:02}"), "value".to_string()))
            .collect();
        let info = InterpreterInfo {
            id: "k1".into(),
            name: "python3".into(),
            state: InterpreterState::Idle,
            connections: None,
            last_activity: None,
            spec: Some(SpecInfo {
                name: "python3".into(),
                display_name: "Python 3".into(),
                language: "python".into(),
                env,
            }),
        };
        let row = interpreter_row(&info);
        let cols: Vec<&str> = row.split('\t').collect();
        assert_eq!(&cols[..7], &["k1", "python3", "Python 3", "python", "idle", "unknown", "unknown"]);
        assert!(cols[7].starts_with("VAR00=value; VAR01=value"));
        assert_eq!(cols[7].chars().count(), ENV_MAX + 3);

        let bare = InterpreterInfo { spec: None, ..info };
        assert!(interpreter_row(&bare).ends_with("unknown\tunknown"));
    }

    fn outcome(status: ExecutionStatus, outputs: Vec<CellOutput>) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            outputs,
            execution_count: Some(1),
            progress: vec![],
            elapsed: Duration::from_millis(2500),
            cell: None,
            timeout: Duration::from_secs(2),
        }
    }

    fn texts(blocks: &[ContentBlock]) -> Vec<&str> {
        blocks.iter().filter_map(ContentBlock::as_text).collect()
    }

    #[test]
    fn test_markers() {
        let timed_out = outcome(ExecutionStatus::TimedOut, vec![CellOutput::stdout("tick")]);
        assert_eq!(
            texts(&render_outcome(&timed_out, true)),
            vec!["tick", "[TIMEOUT ERROR: Execution exceeded 2 seconds]"]
        );
        let stopped = outcome(ExecutionStatus::Interrupted, vec![]);
        assert_eq!(texts(&render_outcome(&stopped, true)), vec!["[INTERRUPTED after 2.5s]"]);
        let empty = outcome(ExecutionStatus::Completed, vec![]);
        assert_eq!(texts(&render_outcome(&empty, true)), vec!["[No output generated]"]);
    }

    #[test]
    fn test_progress_log() {
        let mut run = outcome(
            ExecutionStatus::Completed,
            vec![CellOutput::stdout("a"), CellOutput::stdout("b")],
        );
        run.progress = vec![ProgressSnapshot {
            elapsed: Duration::from_secs(1),
            outputs: vec![CellOutput::stdout("a")],
            first_new: 0,
        }];
        assert_eq!(
            texts(&render_progress_log(&run, true)),
            vec![
                "[1.0s] a",
                "[PROGRESS: 1.0s elapsed, 1 outputs so far]",
                "[2.5s] b",
                "[COMPLETED in 2.5s]"
            ]
        );
    }
}
