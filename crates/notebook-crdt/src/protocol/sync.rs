use crate::doc::NotebookDoc;
use crate::error::Result;

use super::message::{Message, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Pending,
    AwaitingStep2,
    Synced,
}

/// Client side of the y-sync handshake for one document.
#[derive(Debug, Default)]
pub struct SyncProtocol {
    state: SyncState,
}

impl SyncProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Opening step 1 carrying our state vector.
    pub fn start(&mut self, doc: &NotebookDoc) -> Message {
        self.state = SyncState::AwaitingStep2;
        Message::step1(&doc.state_vector())
    }

    /// Applies an incoming sync message and returns the replies it calls for.
    pub fn handle(&mut self, doc: &NotebookDoc, msg: &SyncMessage) -> Result<Vec<Message>> {
        match msg {
            SyncMessage::SyncStep1(_) => {
                let remote = msg.state_vector()?;
                let mut replies = vec![Message::step2(doc.encode_diff(&remote))];
                if self.state == SyncState::Pending {
                    replies.push(self.start(doc));
                }
                Ok(replies)
            }
            SyncMessage::SyncStep2(update) => {
                doc.apply_update(update)?;
                self.state = SyncState::Synced;
                Ok(Vec::new())
            }
            SyncMessage::Update(update) => {
                doc.apply_update(update)?;
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::cell_types;
    use crate::error::DocError;

    /// Feeds every reply of one side into the other until both go quiet.
    fn exchange(
        a: (&mut SyncProtocol, &NotebookDoc),
        b: (&mut SyncProtocol, &NotebookDoc),
        first: Message,
    ) {
        let (pa, da) = a;
        let (pb, db) = b;
        let mut to_b = vec![first];
        let mut to_a = Vec::new();
        while !to_b.is_empty() || !to_a.is_empty() {
            for msg in to_b.drain(..) {
                if let Message::Sync(sync) = msg {
                    to_a.extend(pb.handle(db, &sync).unwrap());
                }
            }
            for msg in to_a.drain(..) {
                if let Message::Sync(sync) = msg {
                    to_b.extend(pa.handle(da, &sync).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_start_moves_to_awaiting() {
        let mut protocol = SyncProtocol::new();
        let msg = protocol.start(&NotebookDoc::new());
        assert_eq!(protocol.state(), SyncState::AwaitingStep2);
        assert!(matches!(msg, Message::Sync(SyncMessage::SyncStep1(_))));
    }

    #[test]
    fn test_step1_from_peer_answers_and_starts() {
        let mut protocol = SyncProtocol::new();
        let peer = NotebookDoc::new();
        let Message::Sync(step1) = Message::step1(&peer.state_vector()) else {
            unreachable!()
        };
        let replies = protocol.handle(&NotebookDoc::new(), &step1).unwrap();
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], Message::Sync(SyncMessage::SyncStep2(_))));
        assert!(matches!(replies[1], Message::Sync(SyncMessage::SyncStep1(_))));
    }

    #[test]
    fn test_handshake_converges_both_ways() {
        let client_doc = NotebookDoc::new();
        let server_doc = NotebookDoc::new();
        server_doc.add_cell("s", cell_types::CODE, "from_server()", None).unwrap();
        client_doc.add_cell("c", cell_types::MARKDOWN, "from client", None).unwrap();

        let mut client = SyncProtocol::new();
        let mut server = SyncProtocol::new();
        let hello = client.start(&client_doc);
        exchange((&mut client, &client_doc), (&mut server, &server_doc), hello);

        assert!(client.is_synced());
        assert_eq!(client_doc.cell_count(), 2);
        assert_eq!(server_doc.cell_count(), 2);
        assert_eq!(client_doc.to_json(), server_doc.to_json());
    }

    #[test]
    fn test_corrupt_update_is_desync() {
        let mut protocol = SyncProtocol::new();
        let err = protocol
            .handle(&NotebookDoc::new(), &SyncMessage::Update(vec![0xde, 0xad]))
            .unwrap_err();
        assert!(matches!(err, DocError::Desync(_)));
    }
}
