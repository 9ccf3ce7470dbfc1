// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Serialized write transactions over a copy-on-write bucket tree
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Command Pattern: Every mutation is a replayable Change
// - Copy-on-Write: Readers keep a stable snapshot of the tree
//
// ============================================================================

pub mod change;
pub mod state;
pub mod tx;

pub use change::Change;
pub use state::{TransactionId, TransactionState};
pub use tx::{BucketMut, ReadTx, WriteTx};
