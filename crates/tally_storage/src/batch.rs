//! Write batches.

use serde::{Deserialize, Serialize};

/// A single table mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableOp {
    /// Inserts or replaces `key` in `table`.
    Put {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
        /// Encoded row value.
        value: Vec<u8>,
    },
    /// Removes `key` from `table`. Removing a missing key is a no-op.
    Delete {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
    },
    /// Removes every row of `table`.
    ClearTable {
        /// Table name.
        table: String,
    },
}

impl TableOp {
    /// Returns the table this operation touches.
    pub fn table(&self) -> &str {
        match self {
            TableOp::Put { table, .. } | TableOp::Delete { table, .. } => table,
            TableOp::ClearTable { table } => table,
        }
    }
}

/// An ordered group of table operations committed atomically.
///
/// A batch becomes exactly one frame in the log: after a crash either
/// every operation of the batch is visible or none is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<TableOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a put.
    pub fn put(&mut self, table: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(TableOp::Put {
            table: table.into(),
            key: key.into(),
            value,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, table: impl Into<String>, key: impl Into<String>) {
        self.ops.push(TableOp::Delete {
            table: table.into(),
            key: key.into(),
        });
    }

    /// Stages removal of every row in `table`.
    pub fn clear_table(&mut self, table: impl Into<String>) {
        self.ops.push(TableOp::ClearTable {
            table: table.into(),
        });
    }

    /// Appends every operation of `other` after the ones already staged.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Returns the staged operations in order.
    pub fn ops(&self) -> &[TableOp] {
        &self.ops
    }

    /// Returns the number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_order() {
        let mut batch = WriteBatch::new();
        batch.put("entries", "e-1", vec![1]);
        batch.delete("ledger", "e-1");
        batch.clear_table("queue");

        let tables: Vec<_> = batch.ops().iter().map(TableOp::table).collect();
        assert_eq!(tables, vec!["entries", "ledger", "queue"]);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn extend_appends() {
        let mut a = WriteBatch::new();
        a.put("t", "1", vec![]);
        let mut b = WriteBatch::new();
        b.delete("t", "1");
        a.extend(b);
        assert_eq!(a.len(), 2);
        assert!(matches!(a.ops()[1], TableOp::Delete { .. }));
    }
}
