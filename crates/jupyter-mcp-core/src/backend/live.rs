use std::fmt;

use async_trait::async_trait;
use notebook_crdt::NotebookDoc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::notebook::{cell_position, insert_position, Cell, CellType, Notebook};
use crate::output::CellOutput;

/// How a replica exchanges updates with the shared document.
#[async_trait]
pub trait LiveChannel: Send {
    /// Sends local changes made since the last publish.
    async fn publish(&mut self, doc: &NotebookDoc) -> Result<()>;

    /// Merges changes peers have made.
    async fn refresh(&mut self, doc: &NotebookDoc) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

struct LiveState {
    doc: NotebookDoc,
    channel: Option<Box<dyn LiveChannel>>,
}

/// A session's replica of the collaborative notebook. Every mutation goes
/// through here, is applied to the replica and then published, all under
/// one lock.
pub struct LiveDocument {
    path: String,
    state: Mutex<LiveState>,
}

impl fmt::Debug for LiveDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveDocument")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn closed(path: &str) -> Error {
    Error::Connection(format!("live document '{path}' is closed"))
}

impl LiveDocument {
    /// Wraps an already synced replica.
    pub fn new(path: impl Into<String>, doc: NotebookDoc, channel: Box<dyn LiveChannel>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LiveState {
                doc,
                channel: Some(channel),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs `edit` against a refreshed replica and publishes the result.
    async fn edit<T: Send>(&self, edit: impl FnOnce(&NotebookDoc) -> Result<T> + Send) -> Result<T> {
        let mut state = self.state.lock().await;
        let LiveState { doc, channel } = &mut *state;
        let channel = channel.as_mut().ok_or_else(|| closed(&self.path))?;
        channel.refresh(doc).await?;
        let value = edit(doc)?;
        channel.publish(doc).await?;
        Ok(value)
    }

    pub async fn snapshot(&self) -> Result<Notebook> {
        let mut state = self.state.lock().await;
        let LiveState { doc, channel } = &mut *state;
        channel.as_mut().ok_or_else(|| closed(&self.path))?.refresh(doc).await?;
        Notebook::from_value(doc.to_json())
    }

    pub async fn cell_count(&self) -> Result<usize> {
        self.edit(|doc| Ok(doc.cell_count() as usize)).await
    }

    /// Inserts a new cell; `-1` appends. Returns the position used.
    pub async fn insert_cell(&self, index: i64, cell_type: CellType, source: &str) -> Result<usize> {
        let cell = serde_json::to_value(Cell::new(cell_type, source))?;
        self.edit(|doc| {
            let at = insert_position(index, doc.cell_count() as usize)?;
            doc.insert_cell(Some(at as u32), &cell)?;
            Ok(at)
        })
        .await
    }

    /// Replaces a cell's source and returns the previous one.
    pub async fn set_source(&self, index: i64, source: &str) -> Result<String> {
        self.edit(|doc| {
            let at = cell_position(index, doc.cell_count() as usize)? as u32;
            let old = doc.cell_source(at)?;
            doc.set_cell_source(at, source)?;
            Ok(old)
        })
        .await
    }

    pub async fn delete_cell(&self, index: i64) -> Result<Cell> {
        let removed = self
            .edit(|doc| {
                let at = cell_position(index, doc.cell_count() as usize)? as u32;
                Ok(doc.remove_cell(at)?)
            })
            .await?;
        Ok(serde_json::from_value(removed)?)
    }

    /// Swaps a cell's outputs and execution count in one transaction.
    pub async fn replace_outputs(
        &self,
        index: usize,
        outputs: &[CellOutput],
        execution_count: Option<i64>,
    ) -> Result<()> {
        let outputs: Vec<_> = outputs.iter().map(CellOutput::to_json).collect();
        self.edit(|doc| {
            let at = cell_position(index as i64, doc.cell_count() as usize)? as u32;
            Ok(doc.replace_outputs(at, &outputs, execution_count)?)
        })
        .await
    }

    /// Pushes any unpublished local state.
    pub async fn publish(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let LiveState { doc, channel } = &mut *state;
        channel.as_mut().ok_or_else(|| closed(&self.path))?.publish(doc).await
    }

    pub async fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let LiveState { doc, channel } = &mut *state;
        channel.as_mut().ok_or_else(|| closed(&self.path))?.refresh(doc).await
    }

    pub async fn close(&self) -> Result<()> {
        let channel = self.state.lock().await.channel.take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use notebook_crdt::StateVector;

    use super::*;

    /// Two replicas wired to each other through a shared peer document.
    struct PeerChannel {
        peer: Arc<StdMutex<NotebookDoc>>,
        published: StateVector,
    }

    #[async_trait]
    impl LiveChannel for PeerChannel {
        async fn publish(&mut self, doc: &NotebookDoc) -> Result<()> {
            let update = doc.encode_diff(&self.published);
            self.peer.lock().unwrap().apply_update(&update)?;
            self.published = doc.state_vector();
            Ok(())
        }

        async fn refresh(&mut self, doc: &NotebookDoc) -> Result<()> {
            let update = self.peer.lock().unwrap().encode_diff(&doc.state_vector());
            doc.apply_update(&update)?;
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn live_over(peer: &Arc<StdMutex<NotebookDoc>>) -> LiveDocument {
        let doc = NotebookDoc::new();
        let channel = PeerChannel {
            peer: peer.clone(),
            published: StateVector::default(),
        };
        LiveDocument::new("t.ipynb", doc, Box::new(channel))
    }

    #[tokio::test]
    async fn test_edits_reach_the_peer() {
        let peer = Arc::new(StdMutex::new(NotebookDoc::new()));
        let live = live_over(&peer);

        assert_eq!(live.insert_cell(-1, CellType::Code, "x = 1").await.unwrap(), 0);
        assert_eq!(live.insert_cell(0, CellType::Markdown, "# T").await.unwrap(), 0);
        let old = live.set_source(1, "x = 2").await.unwrap();
        assert_eq!(old, "x = 1");

        live.replace_outputs(1, &[CellOutput::stdout("2\n")], Some(3))
            .await
            .unwrap();

        let seen = Notebook::from_value(peer.lock().unwrap().to_json()).unwrap();
        assert_eq!(seen.cells.len(), 2);
        assert_eq!(seen.cells[1].source(), "x = 2");
        assert_eq!(seen.cells[1].execution_count(), Some(3));
        assert_eq!(seen.cells[1].outputs(), &[CellOutput::stdout("2\n")]);
    }

    #[tokio::test]
    async fn test_peer_changes_are_visible() {
        let peer = Arc::new(StdMutex::new(NotebookDoc::new()));
        let live = live_over(&peer);
        live.insert_cell(-1, CellType::Code, "a").await.unwrap();
        peer.lock()
            .unwrap()
            .add_cell("p", notebook_crdt::cell_types::RAW, "from peer", None)
            .unwrap();

        let nb = live.snapshot().await.unwrap();
        assert_eq!(nb.len(), 2);
        assert_eq!(nb.cells[1].source(), "from peer");
    }

    #[tokio::test]
    async fn test_out_of_range_and_closed() {
        let peer = Arc::new(StdMutex::new(NotebookDoc::new()));
        let live = live_over(&peer);
        let err = live.delete_cell(0).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);

        live.close().await.unwrap();
        assert_eq!(live.snapshot().await.unwrap_err().kind(), crate::ErrorKind::Connection);
    }
}
