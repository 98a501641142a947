//! Client facade: a thin handle bound to one storage account, plus
//! per-table clients for entity operations.

use std::sync::Arc;

use tracing::info;

use crate::backend::TableBackend;
use crate::batch::{Batch, BatchResult};
use crate::connection::ConnectionString;
use crate::entity::TableEntity;
use crate::error::{Result, TableError};
use crate::memory::MemoryBackend;
use crate::query::{Pager, QueryOptions};
use crate::rest::RestBackend;

/// Service-level handle for one account.
#[derive(Clone)]
pub struct TableServiceClient {
    backend: Arc<dyn TableBackend>,
}

impl std::fmt::Debug for TableServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableServiceClient").finish_non_exhaustive()
    }
}

impl TableServiceClient {
    /// Parse a connection descriptor and bind a REST client to the account
    /// it names. Fails with `Config` on a malformed descriptor.
    pub fn connect(connection_string: &str) -> Result<Self> {
        let conn = ConnectionString::parse(connection_string)?;
        info!(account = %conn.account_name, endpoint = %conn.table_endpoint, "connected");
        Ok(Self {
            backend: Arc::new(RestBackend::new(conn)?),
        })
    }

    /// Bind to an in-process store instead of a live endpoint.
    pub fn in_memory(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    /// Bind to any backend implementation.
    pub fn with_backend(backend: Arc<dyn TableBackend>) -> Self {
        Self { backend }
    }

    /// Create a table and return a client bound to it.
    pub async fn create_table(&self, name: &str) -> Result<TableClient> {
        self.backend.create_table(name).await?;
        Ok(self.table_client(name))
    }

    /// Purely local binding; no network call, cannot fail.
    pub fn table_client(&self, name: &str) -> TableClient {
        TableClient {
            backend: Arc::clone(&self.backend),
            table: name.to_string(),
        }
    }
}

/// Handle for entity operations against one table.
#[derive(Clone)]
pub struct TableClient {
    backend: Arc<dyn TableBackend>,
    table: String,
}

impl TableClient {
    pub fn name(&self) -> &str {
        &self.table
    }

    /// Create the table this client is bound to.
    pub async fn create(&self) -> Result<()> {
        self.backend.create_table(&self.table).await
    }

    /// Insert one entity. Duplicate identities fail with `Conflict`.
    pub async fn add_entity(&self, entity: &TableEntity) -> Result<()> {
        self.backend.insert_entity(&self.table, entity).await
    }

    /// Submit an assembled batch as one atomic request.
    pub async fn submit_batch(&self, batch: &Batch) -> Result<BatchResult> {
        if batch.is_empty() {
            return Err(TableError::Validation("batch has no operations".into()));
        }
        self.backend.submit_batch(&self.table, batch.operations()).await
    }

    /// Begin a lazy, paged listing. Pages are fetched one per call on the
    /// returned pager.
    pub fn list_entities(&self, options: QueryOptions) -> Pager {
        Pager::new(Arc::clone(&self.backend), self.table.clone(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_client_binding_is_local() {
        // Binding to a table that does not exist must not fail; only the
        // first network operation against it does.
        let backend = Arc::new(MemoryBackend::new());
        let service = TableServiceClient::in_memory(Arc::clone(&backend));
        let client = service.table_client("ghost");
        assert_eq!(client.name(), "ghost");

        let entity = TableEntity::new("pk", "rk").unwrap();
        assert!(client.add_entity(&entity).await.unwrap_err().is_table_missing());
    }

    #[tokio::test]
    async fn create_table_returns_a_bound_client() {
        let backend = Arc::new(MemoryBackend::new());
        let service = TableServiceClient::in_memory(Arc::clone(&backend));

        let client = service.create_table("stock").await.unwrap();
        let entity = TableEntity::new("pk", "rk").unwrap();
        client.add_entity(&entity).await.unwrap();
        assert_eq!(backend.row_count("stock"), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_locally() {
        let backend = Arc::new(MemoryBackend::new());
        let service = TableServiceClient::in_memory(backend);
        let client = service.create_table("stock").await.unwrap();

        let err = client.submit_batch(&Batch::new()).await.unwrap_err();
        assert!(matches!(err, TableError::Validation(_)));
    }

    #[test]
    fn connect_rejects_malformed_descriptors() {
        let err = TableServiceClient::connect("not-a-descriptor").unwrap_err();
        assert!(matches!(err, TableError::Config(_)));
    }
}
