use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Tick;

/// Identifier of a transaction: the transaction's own tick plus the tick of
/// its outermost ancestor. Top-level transactions have `own == top`.
/// `(0, 0)` is the reserved "no transaction" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    own: Tick,
    top: Tick,
}

impl TransactionId {
    pub const NONE: TransactionId = TransactionId { own: 0, top: 0 };

    pub fn new(own: Tick, top: Tick) -> Self {
        Self { own, top }
    }

    /// Id of a top-level transaction.
    pub fn top_level(own: Tick) -> Self {
        Self { own, top: own }
    }

    pub fn own(&self) -> Tick {
        self.own
    }

    pub fn top(&self) -> Tick {
        self.top
    }

    pub fn is_none(&self) -> bool {
        self.own == 0
    }

    pub fn is_top_level(&self) -> bool {
        self.own == self.top
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.own, self.top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_id() {
        let id = TransactionId::top_level(7);
        assert_eq!(id.own(), 7);
        assert_eq!(id.top(), 7);
        assert!(id.is_top_level());
        assert!(!id.is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(TransactionId::NONE.is_none());
        assert_eq!(TransactionId::default(), TransactionId::NONE);
    }
}
