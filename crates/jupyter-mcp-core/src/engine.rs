//! Runs code on a session's interpreter and collects what it prints.
//!
//! An execution moves `Pending -> Submitted -> Running` and ends in one of
//! [`ExecutionStatus`]. Exceptions raised by the code are ordinary outputs,
//! not failures of the run. Only a restart, a lost connection or an
//! unwritable document make [`ExecutionEngine::execute`] return `Err`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::backend::InterpreterBackend;
use crate::error::{Error, Result};
use crate::kernel::{Execution, InterpreterState, KernelEvent};
use crate::notebook::{cell_position, CellType};
use crate::output::CellOutput;
use crate::registry::{Session, SessionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    /// A notebook cell by index. Its outputs are written back to the cell.
    Cell(i64),
    /// Ad-hoc code; the document is not touched.
    Code(String),
}

/// How progress is surfaced while the code runs. Completion semantics are
/// the same for all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingPolicy {
    #[default]
    Bounded,
    /// Snapshot the outputs every progress interval.
    Streaming,
    /// Like `Streaming`, and also write and publish the partial outputs to
    /// the document at each interval.
    ForcedSync,
}

/// Outputs seen so far, taken at a progress tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub elapsed: Duration,
    pub outputs: Vec<CellOutput>,
    /// Index of the first output not in the previous snapshot.
    pub first_new: usize,
}

impl ProgressSnapshot {
    pub fn new_outputs(&self) -> &[CellOutput] {
        &self.outputs[self.first_new.min(self.outputs.len())..]
    }
}

#[derive(Debug)]
pub struct ExecutionRequest {
    pub target: ExecutionTarget,
    pub policy: TimingPolicy,
    /// Falls back to the configured execution or code timeout.
    pub timeout: Option<Duration>,
    pub progress_interval: Option<Duration>,
    cancel: Option<oneshot::Receiver<()>>,
    progress: Option<mpsc::Sender<ProgressSnapshot>>,
}

impl ExecutionRequest {
    pub fn new(target: ExecutionTarget) -> Self {
        Self {
            target,
            policy: TimingPolicy::Bounded,
            timeout: None,
            progress_interval: None,
            cancel: None,
            progress: None,
        }
    }

    pub fn cell(index: i64) -> Self {
        Self::new(ExecutionTarget::Cell(index))
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(ExecutionTarget::Code(source.into()))
    }

    pub fn with_policy(mut self, policy: TimingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Sending on (not dropping) the paired sender interrupts the run.
    pub fn with_cancel(mut self, cancel: oneshot::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Snapshots are offered with `try_send`; a full sink misses them.
    pub fn with_progress_sink(mut self, sink: mpsc::Sender<ProgressSnapshot>) -> Self {
        self.progress = Some(sink);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Interrupted,
    /// The interpreter went away mid-run.
    Errored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub outputs: Vec<CellOutput>,
    pub execution_count: Option<i64>,
    pub progress: Vec<ProgressSnapshot>,
    pub elapsed: Duration,
    /// Where the outputs were written, for cell targets.
    pub cell: Option<usize>,
    pub timeout: Duration,
}

impl ExecutionOutcome {
    /// The code raised; the last output is its error.
    pub fn raised(&self) -> bool {
        self.outputs.last().is_some_and(CellOutput::is_error)
    }
}

/// Accumulates one execution's events in arrival order.
#[derive(Debug, Default)]
struct Collector {
    outputs: Vec<CellOutput>,
    pending_clear: bool,
    execution_count: Option<i64>,
    reported: usize,
}

impl Collector {
    fn apply(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::Output(output) => {
                if self.pending_clear {
                    self.clear();
                }
                self.outputs.push(output);
            }
            KernelEvent::ClearOutput { wait: true } => self.pending_clear = true,
            KernelEvent::ClearOutput { wait: false } => self.clear(),
            KernelEvent::ExecutionCount(count) => self.execution_count = Some(count),
            _ => {}
        }
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.pending_clear = false;
        self.reported = 0;
    }

    fn snapshot(&mut self, elapsed: Duration) -> ProgressSnapshot {
        let first_new = self.reported.min(self.outputs.len());
        self.reported = self.outputs.len();
        ProgressSnapshot {
            elapsed,
            outputs: self.outputs.clone(),
            first_new,
        }
    }
}

/// The cell an execution runs, found before anything else is touched.
struct TargetCell {
    position: usize,
    id: String,
}

async fn cancelled(cancel: &mut Option<oneshot::Receiver<()>>) {
    if let Some(rx) = cancel.as_mut() {
        if rx.await.is_ok() {
            return;
        }
        *cancel = None;
    }
    std::future::pending::<()>().await
}

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    registry: Arc<SessionRegistry>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Runs `request` on `session` to a terminal state.
    ///
    /// Executions on one session are serialized; the interpreter is started
    /// if dead and given the configured idle wait before submission.
    pub async fn execute(
        &self,
        session: &Session,
        mut request: ExecutionRequest,
    ) -> Result<ExecutionOutcome> {
        let ctx = self.registry.context();
        let settings = ctx.config().execution.clone();
        let backend = ctx.resolve()?;

        let (source, target) = match &request.target {
            ExecutionTarget::Code(code) => (code.clone(), None),
            ExecutionTarget::Cell(index) => {
                let notebook = session.read(backend.documents.as_ref()).await?;
                let position = cell_position(*index, notebook.len())?;
                let cell = &notebook.cells[position];
                if cell.cell_type() != CellType::Code {
                    return Err(Error::validation(format!(
                        "Cell {index} is a {} cell, only code cells can be executed.",
                        cell.cell_type()
                    )));
                }
                (
                    cell.source().to_string(),
                    Some(TargetCell {
                        position,
                        id: cell.id().to_string(),
                    }),
                )
            }
        };
        let timeout = request.timeout.unwrap_or(match request.target {
            ExecutionTarget::Code(_) => settings.code_timeout(),
            ExecutionTarget::Cell(_) => settings.timeout(),
        });
        let interval = request
            .progress_interval
            .unwrap_or_else(|| settings.progress_interval())
            .max(Duration::from_millis(100));

        let _running = session.begin_execution().await;
        let interpreters = backend.interpreters.clone();
        let mut kernel_id = self.registry.ensure_interpreter(session).await?;
        let state = interpreters
            .wait_idle(&kernel_id, settings.idle_wait())
            .await?;
        if !state.is_alive() {
            self.registry.mark_dead(session);
            kernel_id = self.registry.ensure_interpreter(session).await?;
        } else if matches!(state, InterpreterState::Busy | InterpreterState::Starting) {
            tracing::warn!(session = %session.name(), kernel_id = %kernel_id, %state, "interpreter not idle after waiting, submitting anyway");
        }

        let mut execution = interpreters.execute(&kernel_id, &source).await?;
        tracing::debug!(session = %session.name(), kernel_id = %kernel_id, msg_id = %execution.msg_id, "execution submitted");

        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let streaming = request.policy != TimingPolicy::Bounded;
        let mut cancel = request.cancel.take();
        let mut collector = Collector::default();
        let mut progress = Vec::new();

        let status = loop {
            tokio::select! {
                event = execution.events.recv() => match event {
                    None => break ExecutionStatus::Completed,
                    Some(KernelEvent::Died) => {
                        self.registry.mark_dead(session);
                        break ExecutionStatus::Errored("interpreter died".into());
                    }
                    Some(KernelEvent::Restarted) => {
                        return Err(Error::InterpreterRestarted(kernel_id));
                    }
                    Some(KernelEvent::Disconnected) => {
                        return Err(Error::Connection(format!(
                            "lost connection to interpreter {kernel_id} during execution"
                        )));
                    }
                    Some(event) => collector.apply(event),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(session = %session.name(), kernel_id = %kernel_id, ?timeout, "execution timed out");
                    self.interrupt_and_drain(interpreters.as_ref(), session, &kernel_id, &mut execution, &mut collector, settings.interrupt_grace()).await;
                    break ExecutionStatus::TimedOut;
                }
                _ = cancelled(&mut cancel) => {
                    tracing::info!(session = %session.name(), kernel_id = %kernel_id, "execution cancelled");
                    self.interrupt_and_drain(interpreters.as_ref(), session, &kernel_id, &mut execution, &mut collector, settings.interrupt_grace()).await;
                    break ExecutionStatus::Interrupted;
                }
                _ = ticker.tick(), if streaming => {
                    let snapshot = collector.snapshot(started.elapsed());
                    if let Some(sink) = &request.progress {
                        let _ = sink.try_send(snapshot.clone());
                    }
                    if request.policy == TimingPolicy::ForcedSync {
                        if let Some(target) = &target {
                            if let Err(e) = self.write_back(session, target, &collector.outputs, collector.execution_count).await {
                                tracing::warn!(session = %session.name(), error = %e, "failed to sync partial outputs");
                            }
                        }
                    }
                    progress.push(snapshot);
                }
            }
        };

        let elapsed = started.elapsed();
        let cell = match &target {
            Some(target) => {
                self.write_back(session, target, &collector.outputs, collector.execution_count)
                    .await?
            }
            None => None,
        };
        tracing::debug!(session = %session.name(), ?status, outputs = collector.outputs.len(), ?elapsed, "execution finished");
        Ok(ExecutionOutcome {
            status,
            outputs: collector.outputs,
            execution_count: collector.execution_count,
            progress,
            elapsed,
            cell,
            timeout,
        })
    }

    /// Interrupts, then keeps what arrives before the grace period runs out.
    /// An unresponsive interpreter costs at most `grace`.
    async fn interrupt_and_drain(
        &self,
        interpreters: &dyn InterpreterBackend,
        session: &Session,
        kernel_id: &str,
        execution: &mut Execution,
        collector: &mut Collector,
        grace: Duration,
    ) {
        let deadline = Instant::now() + grace;
        match tokio::time::timeout_at(deadline, interpreters.interrupt_interpreter(kernel_id)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(kernel_id = %kernel_id, error = %e, "interrupt failed"),
            Err(_) => tracing::warn!(kernel_id = %kernel_id, "interrupt not acknowledged"),
        }
        loop {
            match tokio::time::timeout_at(deadline, execution.events.recv()).await {
                Ok(Some(KernelEvent::Died)) => {
                    self.registry.mark_dead(session);
                    break;
                }
                Ok(Some(KernelEvent::Restarted | KernelEvent::Disconnected)) | Ok(None) => break,
                Ok(Some(event)) => collector.apply(event),
                Err(_) => {
                    tracing::warn!(kernel_id = %kernel_id, "interpreter still busy after interrupt");
                    break;
                }
            }
        }
    }

    /// Writes outputs to the target cell in one update, following the cell
    /// by id if peers moved it. Returns where it landed, or `None` if the
    /// cell is gone.
    async fn write_back(
        &self,
        session: &Session,
        target: &TargetCell,
        outputs: &[CellOutput],
        execution_count: Option<i64>,
    ) -> Result<Option<usize>> {
        let documents = self.registry.context().resolve()?.documents;
        let notebook = session.read(documents.as_ref()).await?;
        let position = if notebook
            .cells
            .get(target.position)
            .is_some_and(|c| c.id() == target.id)
        {
            target.position
        } else if let Some(moved) = notebook.cells.iter().position(|c| c.id() == target.id) {
            moved
        } else {
            tracing::warn!(session = %session.name(), cell_id = %target.id, "executed cell was deleted, dropping outputs");
            return Ok(None);
        };
        session
            .write_outputs(documents.as_ref(), position, outputs, execution_count)
            .await?;
        Ok(Some(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream(text: &str) -> KernelEvent {
        KernelEvent::Output(CellOutput::stdout(text))
    }

    #[test]
    fn test_clear_output_wait_is_deferred() {
        let mut c = Collector::default();
        c.apply(stream("a"));
        c.apply(KernelEvent::ClearOutput { wait: true });
        assert_eq!(c.outputs.len(), 1);
        c.apply(stream("b"));
        assert_eq!(c.outputs, vec![CellOutput::stdout("b")]);

        c.apply(KernelEvent::ClearOutput { wait: false });
        assert!(c.outputs.is_empty());
    }

    #[test]
    fn test_snapshots_mark_new_outputs() {
        let mut c = Collector::default();
        c.apply(stream("1"));
        let first = c.snapshot(Duration::from_secs(1));
        assert_eq!(first.new_outputs().len(), 1);
        c.apply(stream("2"));
        c.apply(KernelEvent::ExecutionCount(7));
        let second = c.snapshot(Duration::from_secs(2));
        assert_eq!(second.new_outputs(), &[CellOutput::stdout("2")]);
        assert_eq!(c.execution_count, Some(7));
        assert!(c.snapshot(Duration::from_secs(3)).new_outputs().is_empty());
    }

    #[test]
    fn test_raised_looks_at_last_output() {
        let outcome = ExecutionOutcome {
            status: ExecutionStatus::Completed,
            outputs: vec![
                CellOutput::stdout("x"),
                serde_json::from_value(json!({
                    "output_type": "error", "ename": "E", "evalue": "v", "traceback": []
                }))
                .unwrap(),
            ],
            execution_count: Some(1),
            progress: vec![],
            elapsed: Duration::ZERO,
            cell: None,
            timeout: Duration::from_secs(1),
        };
        assert!(outcome.raised());
    }

    #[tokio::test]
    async fn test_cancelled_ignores_dropped_sender() {
        let (tx, rx) = oneshot::channel::<()>();
        drop(tx);
        let mut cancel = Some(rx);
        let waited = tokio::time::timeout(Duration::from_millis(20), cancelled(&mut cancel)).await;
        assert!(waited.is_err());
        assert!(cancel.is_none());
    }
}
