// ============================================================================
// Transaction State Management
// ============================================================================
//
// Write transactions move through Active -> Committed/Aborted. Ids are handed
// out by the owning store so that they can be compared against the id a
// snapshot was taken at.
//
// ============================================================================

use std::fmt;

/// Identifier of a committed (or committing) write transaction.
///
/// Ids grow monotonically per store and survive restarts: the store resumes
/// from the highest id found in its snapshot and log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The id following this one
    pub fn next(self) -> Self {
        TransactionId(self.0 + 1)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state following the State Pattern
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_sequence() {
        let id = TransactionId::default();
        assert_eq!(id.next().as_u64(), 1);
        assert!(id.next() > id);
        assert_eq!(id.next().next().to_string(), "txn_2");
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Active.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
    }
}
