//! Batch builder: an ordered sequence of entity operations for a single
//! partition, submitted as one atomic unit.

use crate::entity::TableEntity;
use crate::error::{Result, TableError};

/// The service rejects changesets with more than this many operations.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// One entry in a batch. The upsert variants carry an echo flag asking the
/// service to return the entity as stored.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Insert { entity: TableEntity },
    InsertOrReplace { entity: TableEntity, echo: bool },
    InsertOrMerge { entity: TableEntity, echo: bool },
}

impl BatchOperation {
    pub fn entity(&self) -> &TableEntity {
        match self {
            BatchOperation::Insert { entity }
            | BatchOperation::InsertOrReplace { entity, .. }
            | BatchOperation::InsertOrMerge { entity, .. } => entity,
        }
    }

    pub fn echo(&self) -> bool {
        match self {
            BatchOperation::Insert { .. } => false,
            BatchOperation::InsertOrReplace { echo, .. }
            | BatchOperation::InsertOrMerge { echo, .. } => *echo,
        }
    }
}

/// Accumulates operations locally; nothing touches the network until the
/// batch is handed to `TableClient::submit_batch`.
#[derive(Debug, Default)]
pub struct Batch {
    partition_key: Option<String>,
    operations: Vec<BatchOperation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: TableEntity) -> Result<()> {
        self.push(BatchOperation::Insert { entity })
    }

    pub fn insert_or_replace(&mut self, entity: TableEntity, echo: bool) -> Result<()> {
        self.push(BatchOperation::InsertOrReplace { entity, echo })
    }

    pub fn insert_or_merge(&mut self, entity: TableEntity, echo: bool) -> Result<()> {
        self.push(BatchOperation::InsertOrMerge { entity, echo })
    }

    fn push(&mut self, operation: BatchOperation) -> Result<()> {
        if self.operations.len() >= MAX_BATCH_OPERATIONS {
            return Err(TableError::Validation(format!(
                "batch cannot exceed {} operations",
                MAX_BATCH_OPERATIONS
            )));
        }

        let incoming = operation.entity().partition_key();
        match &self.partition_key {
            None => self.partition_key = Some(incoming.to_string()),
            Some(existing) if existing == incoming => {}
            Some(existing) => {
                return Err(TableError::Validation(format!(
                    "batch is bound to partition {} but operation targets {}",
                    existing, incoming
                )));
            }
        }

        self.operations.push(operation);
        Ok(())
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Per-operation outcome of a successful batch.
#[derive(Debug)]
pub struct BatchResponse {
    pub row_key: String,
    /// The stored entity, present only when the operation asked for an echo.
    pub echoed: Option<TableEntity>,
}

#[derive(Debug)]
pub struct BatchResult {
    pub responses: Vec<BatchResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(pk: &str, rk: &str) -> TableEntity {
        TableEntity::new(pk, rk).unwrap()
    }

    #[test]
    fn operations_accumulate_in_order() {
        let mut batch = Batch::new();
        batch.insert(entity("1", "rowkey1")).unwrap();
        batch.insert_or_replace(entity("1", "rowkey2"), true).unwrap();
        batch.insert_or_merge(entity("1", "3"), true).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.partition_key(), Some("1"));
        let row_keys: Vec<_> = batch
            .operations()
            .iter()
            .map(|op| op.entity().row_key())
            .collect();
        assert_eq!(row_keys, vec!["rowkey1", "rowkey2", "3"]);
    }

    #[test]
    fn mixed_partitions_rejected() {
        let mut batch = Batch::new();
        batch.insert(entity("1", "a")).unwrap();
        let err = batch.insert(entity("2", "b")).unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));
        // The failed push must not grow the batch.
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn batch_size_is_capped() {
        let mut batch = Batch::new();
        for i in 0..MAX_BATCH_OPERATIONS {
            batch.insert(entity("pk", &i.to_string())).unwrap();
        }
        let err = batch.insert(entity("pk", "overflow")).unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));
    }

    #[test]
    fn echo_flag_only_on_upserts() {
        let mut batch = Batch::new();
        batch.insert(entity("1", "a")).unwrap();
        batch.insert_or_replace(entity("1", "b"), true).unwrap();
        batch.insert_or_merge(entity("1", "c"), false).unwrap();

        let echoes: Vec<_> = batch.operations().iter().map(|op| op.echo()).collect();
        assert_eq!(echoes, vec![false, true, false]);
    }
}
