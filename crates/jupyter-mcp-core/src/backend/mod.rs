//! The document and interpreter capability sets, each with a Local
//! implementation over host-provided managers and a Remote one over a
//! Jupyter server.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernel::{Execution, InterpreterState};
use crate::notebook::{cell_position, insert_position, Cell, CellType, Notebook};
use crate::output::CellOutput;

pub mod live;
pub mod local;
pub mod remote;

pub use live::{LiveChannel, LiveDocument};
pub use local::{
    ContentsManager, HostError, HostKernel, HostManagers, KernelManager, LocalDocuments,
    LocalInterpreters, Room, RoomManager,
};
pub use remote::{RemoteDocuments, RemoteInterpreters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    Notebook,
    File,
}

impl EntryKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "directory" => EntryKind::Directory,
            "notebook" => EntryKind::Notebook,
            _ => EntryKind::File,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Directory => "directory",
            EntryKind::Notebook => "notebook",
            EntryKind::File => "file",
        }
    }
}

/// One item of a directory listing; `path` is relative to the host root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterInfo {
    pub id: String,
    pub name: String,
    pub state: InterpreterState,
    pub connections: Option<u64>,
    pub last_activity: Option<String>,
    pub spec: Option<SpecInfo>,
}

/// A change to one cell's source, for file-mode writes.
#[derive(Debug, Clone, PartialEq)]
pub enum CellEdit {
    /// `index` of `-1` appends.
    Insert {
        index: i64,
        cell_type: CellType,
        source: String,
    },
    Overwrite { index: i64, source: String },
}

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn read_document(&self, path: &str) -> Result<Notebook>;

    async fn save_document(&self, path: &str, notebook: &Notebook) -> Result<()>;

    /// Creates an empty notebook unless one exists. Returns whether it did.
    async fn create_document(&self, path: &str) -> Result<bool>;

    async fn document_exists(&self, path: &str) -> Result<bool>;

    /// Immediate children of a directory.
    async fn list_directory(&self, path: &str) -> Result<Vec<DocumentEntry>>;

    /// Joins the collaborative document for `path`.
    async fn open_live_document(&self, path: &str) -> Result<LiveDocument>;

    /// Re-establishes whatever connection state the backend keeps.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Applies `edit` with a read-modify-write of the whole document and
    /// returns the index the edit landed at.
    async fn write_cell(&self, path: &str, edit: CellEdit) -> Result<usize> {
        let mut notebook = self.read_document(path).await?;
        let index = match edit {
            CellEdit::Insert {
                index,
                cell_type,
                source,
            } => {
                let at = insert_position(index, notebook.len())?;
                notebook.cells.insert(at, Cell::new(cell_type, source));
                at
            }
            CellEdit::Overwrite { index, source } => {
                let at = cell_position(index, notebook.len())?;
                notebook.cells[at].set_source(source);
                at
            }
        };
        self.save_document(path, &notebook).await?;
        Ok(index)
    }

    async fn delete_cell(&self, path: &str, index: i64) -> Result<Cell> {
        let mut notebook = self.read_document(path).await?;
        let at = cell_position(index, notebook.len())?;
        let removed = notebook.cells.remove(at);
        self.save_document(path, &notebook).await?;
        Ok(removed)
    }

    async fn write_outputs(
        &self,
        path: &str,
        index: usize,
        outputs: &[CellOutput],
        execution_count: Option<i64>,
    ) -> Result<()> {
        let mut notebook = self.read_document(path).await?;
        notebook
            .cell_mut(index)?
            .set_outputs(outputs.to_vec(), execution_count);
        self.save_document(path, &notebook).await
    }

    /// Walks the tree under `path`, at most `max_depth` levels deep when
    /// `recursive`. Entries come back sorted by path.
    async fn list_documents(
        &self,
        path: &str,
        recursive: bool,
        max_depth: usize,
    ) -> Result<Vec<DocumentEntry>> {
        let mut found = Vec::new();
        let mut pending = vec![(path.to_string(), 0usize)];
        while let Some((dir, depth)) = pending.pop() {
            for entry in self.list_directory(&dir).await? {
                if recursive && entry.kind == EntryKind::Directory && depth + 1 < max_depth {
                    pending.push((entry.path.clone(), depth + 1));
                }
                found.push(entry);
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

#[async_trait]
pub trait InterpreterBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Starts an interpreter from kernelspec `spec` (the host default when
    /// `None`) and returns its id.
    async fn start_interpreter(&self, spec: Option<&str>, path: Option<&str>) -> Result<String>;

    /// Shuts the interpreter down. Executions still routed to it end with
    /// [`KernelEvent::Restarted`](crate::kernel::KernelEvent::Restarted).
    async fn stop_interpreter(&self, id: &str) -> Result<()>;

    async fn interrupt_interpreter(&self, id: &str) -> Result<()>;

    async fn interpreter_state(&self, id: &str) -> Result<InterpreterState>;

    async fn list_interpreters(&self) -> Result<Vec<InterpreterInfo>>;

    async fn list_specs(&self) -> Result<Vec<SpecInfo>>;

    async fn execute(&self, id: &str, source: &str) -> Result<Execution>;

    /// Waits at most `max` for the interpreter to stop being busy.
    async fn wait_idle(&self, id: &str, max: Duration) -> Result<InterpreterState>;

    /// Drops stale interpreter connections so the next call reconnects.
    async fn reconnect(&self) -> Result<()>;
}

/// The resolved pair of backends, one per concern.
#[derive(Clone)]
pub struct Backend {
    pub documents: Arc<dyn DocumentBackend>,
    pub interpreters: Arc<dyn InterpreterBackend>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("documents", &self.documents.kind())
            .field("interpreters", &self.interpreters.kind())
            .finish()
    }
}

pub(crate) fn spec_lookup(specs: Vec<SpecInfo>) -> HashMap<String, SpecInfo> {
    specs.into_iter().map(|spec| (spec.name.clone(), spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// File-mode documents over a map, to exercise the provided methods.
    #[derive(Default)]
    struct MapDocuments {
        notebooks: Mutex<HashMap<String, Notebook>>,
        dirs: HashMap<String, Vec<DocumentEntry>>,
    }

    #[async_trait]
    impl DocumentBackend for MapDocuments {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn read_document(&self, path: &str) -> Result<Notebook> {
            self.notebooks
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::NotFound(path.into()))
        }

        async fn save_document(&self, path: &str, notebook: &Notebook) -> Result<()> {
            self.notebooks.lock().unwrap().insert(path.into(), notebook.clone());
            Ok(())
        }

        async fn create_document(&self, path: &str) -> Result<bool> {
            let mut notebooks = self.notebooks.lock().unwrap();
            if notebooks.contains_key(path) {
                return Ok(false);
            }
            notebooks.insert(path.into(), Notebook::default());
            Ok(true)
        }

        async fn document_exists(&self, path: &str) -> Result<bool> {
            Ok(self.notebooks.lock().unwrap().contains_key(path))
        }

        async fn list_directory(&self, path: &str) -> Result<Vec<DocumentEntry>> {
            Ok(self.dirs.get(path).cloned().unwrap_or_default())
        }

        async fn open_live_document(&self, _path: &str) -> Result<LiveDocument> {
            Err(Error::Configuration("no live documents here".into()))
        }
    }

    fn entry(path: &str, kind: EntryKind) -> DocumentEntry {
        DocumentEntry {
            path: path.into(),
            kind,
            size: None,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn test_file_mode_cell_edits() {
        let docs = MapDocuments::default();
        assert!(docs.create_document("a.ipynb").await.unwrap());
        assert!(!docs.create_document("a.ipynb").await.unwrap());

        let at = docs
            .write_cell(
                "a.ipynb",
                CellEdit::Insert {
                    index: -1,
                    cell_type: CellType::Code,
                    source: "1 + 1".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(at, 0);
        docs.write_cell(
            "a.ipynb",
            CellEdit::Overwrite {
                index: 0,
                source: "2 + 2".into(),
            },
        )
        .await
        .unwrap();
        docs.write_outputs("a.ipynb", 0, &[CellOutput::stdout("4")], Some(1))
            .await
            .unwrap();

        let nb = docs.read_document("a.ipynb").await.unwrap();
        assert_eq!(nb.cells[0].source(), "2 + 2");
        assert_eq!(nb.cells[0].execution_count(), Some(1));

        let err = docs.delete_cell("a.ipynb", 3).await.unwrap_err();
        assert_eq!(err.to_string(), "Cell index 3 is out of range. Notebook has 1 cells.");
        assert_eq!(docs.delete_cell("a.ipynb", 0).await.unwrap().source(), "2 + 2");
    }

    #[tokio::test]
    async fn test_list_documents_depth() {
        let mut docs = MapDocuments::default();
        docs.dirs.insert(
            "".into(),
            vec![entry("b.ipynb", EntryKind::Notebook), entry("sub", EntryKind::Directory)],
        );
        docs.dirs.insert(
            "sub".into(),
            vec![entry("sub/a.txt", EntryKind::File), entry("sub/deep", EntryKind::Directory)],
        );
        docs.dirs
            .insert("sub/deep".into(), vec![entry("sub/deep/x.py", EntryKind::File)]);

        let flat = docs.list_documents("", false, 3).await.unwrap();
        assert_eq!(flat.len(), 2);

        let paths: Vec<String> = docs
            .list_documents("", true, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["b.ipynb", "sub", "sub/a.txt", "sub/deep"]);
    }
}
