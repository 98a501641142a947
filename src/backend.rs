//! The seam between the client facade and whatever actually stores entities.
//!
//! Two implementations exist: the REST client speaking to a live emulator
//! and an in-process store with the same observable semantics.

use async_trait::async_trait;

use crate::batch::{BatchOperation, BatchResult};
use crate::entity::TableEntity;
use crate::error::Result;
use crate::query::QueryOptions;

/// Opaque resume point for a paged query, mirroring the service's
/// NextPartitionKey/NextRowKey token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: String,
}

/// One page of query results plus the token to fetch the next one, if any.
#[derive(Debug)]
pub struct QueryPage {
    pub entities: Vec<TableEntity>,
    pub continuation: Option<Continuation>,
}

#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Create a table. Fails with `Conflict` if it already exists.
    async fn create_table(&self, table: &str) -> Result<()>;

    /// Insert a single entity. Fails with `Conflict` on a duplicate identity
    /// and `TableNotFound` if the table is missing.
    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> Result<()>;

    /// Submit a single-partition batch atomically: either every operation
    /// applies or none do.
    async fn submit_batch(&self, table: &str, operations: &[BatchOperation])
        -> Result<BatchResult>;

    /// Fetch one page of a filtered, projected query. Each call is one
    /// round-trip; the returned continuation resumes where the page ended.
    async fn query_entities(
        &self,
        table: &str,
        options: &QueryOptions,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage>;
}
