//! Pending delivery receipts for originated direct messages.
//!
//! When this node originates a `direct` message, the id is registered
//! here; the entry is resolved when the matching `deliveryReceipt`
//! arrives. The table only feeds the user-visible "delivered" signal —
//! no retry hangs off it.

use std::collections::HashMap;

use pigeon_types::{MessageId, Timestamp};

/// Outstanding direct messages awaiting a receipt.
#[derive(Default)]
pub struct ReceiptTable {
    pending: HashMap<MessageId, Timestamp>,
}

impl ReceiptTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an originated direct message.
    pub fn register(&mut self, message_id: MessageId, sent_at: Timestamp) {
        self.pending.insert(message_id, sent_at);
    }

    /// Resolves a receipt. Returns `true` if the id was pending — a
    /// receipt for a message we never sent (or already resolved)
    /// returns `false`.
    pub fn resolve(&mut self, message_id: &MessageId) -> bool {
        self.pending.remove(message_id).is_some()
    }

    /// Whether a message is still awaiting its receipt.
    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.contains_key(message_id)
    }

    /// Number of outstanding receipts.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let mut table = ReceiptTable::new();
        let id = MessageId::new([1; 16]);

        table.register(id, Timestamp::now());
        assert!(table.is_pending(&id));

        assert!(table.resolve(&id));
        assert!(!table.is_pending(&id));
        assert!(table.is_empty());

        // Second receipt for the same id is a no-op.
        assert!(!table.resolve(&id));
    }

    #[test]
    fn unknown_receipt_not_resolved() {
        let mut table = ReceiptTable::new();
        assert!(!table.resolve(&MessageId::new([9; 16])));
    }
}
