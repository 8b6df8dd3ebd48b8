//! Session, backend and execution core for driving Jupyter notebooks from
//! agent tool calls.
//!
//! - [`ModeContext`] decides once whether documents and interpreters are
//!   reached through the host process ([`backend::local`]) or a Jupyter
//!   server ([`backend::remote`]).
//! - [`SessionRegistry`] tracks open notebooks and the interpreter bound to
//!   each.
//! - [`ExecutionEngine`] runs code with bounded, streaming or forced-sync
//!   progress and writes outputs back to the notebook.
//! - [`SafeOperation`] retries once after a transient connection failure.
//! - [`NotebookTools`] is the tool-call surface tying these together.
//!
//! ```ignore
//! let ctx = Arc::new(ModeContext::new(Config::from_env()?, None));
//! let tools = NotebookTools::new(ctx);
//! tools.connect_session("main", "analysis.ipynb", true, None).await?;
//! let blocks = tools.execute_cell(0, TimingPolicy::Bounded, None, None).await?;
//! ```

pub mod backend;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod mode;
pub mod notebook;
pub mod output;
pub mod registry;
pub mod safe;
pub mod test_kernel;
pub mod tools;

pub use backend::{Backend, BackendKind, DocumentBackend, HostManagers, InterpreterBackend};
pub use config::{Access, Config, ExecutionConfig};
pub use engine::{
    ExecutionEngine, ExecutionOutcome, ExecutionRequest, ExecutionStatus, ExecutionTarget,
    ProgressSnapshot, TimingPolicy,
};
pub use error::{Error, ErrorKind, Result};
pub use kernel::{InterpreterState, KernelEvent};
pub use mode::{ModeContext, ResolvedMode};
pub use notebook::{Cell, CellType, Notebook};
pub use output::{CellOutput, ContentBlock};
pub use registry::{Session, SessionInfo, SessionRegistry};
pub use safe::SafeOperation;
pub use tools::{NotebookTools, ToolOutput};
