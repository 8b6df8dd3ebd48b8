//! y-sync wire protocol as spoken by Jupyter collaboration rooms.
//!
//! ```text
//! frame     = varUint(kind) payload
//! kind      = 0 sync | 1 awareness | 2 auth | 3 awareness query
//! sync      = varUint(step) varBuffer
//! step      = 0 SyncStep1(state vector) | 1 SyncStep2(update) | 2 Update(update)
//! ```

pub mod message;
pub mod sync;

pub use message::{Message, SyncMessage};
pub use sync::{SyncProtocol, SyncState};
