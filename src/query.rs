//! Query options and the stateful pager over a lazy result sequence.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{Continuation, TableBackend};
use crate::entity::TableEntity;
use crate::error::Result;

/// Options for a filtered, projected, paged listing.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub filter: Option<String>,
    pub select: Option<Vec<String>>,
    pub top: Option<u32>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricted filter grammar: `Field eq 'value'`.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn select<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }
}

/// One fetched page of entities.
#[derive(Debug)]
pub struct Page {
    pub entities: Vec<TableEntity>,
}

/// Lazy page sequence. Each `next_page` call is one round-trip. The pager is
/// stateful and must be driven by a single consumer.
pub struct Pager {
    backend: Arc<dyn TableBackend>,
    table: String,
    options: QueryOptions,
    continuation: Option<Continuation>,
    exhausted: bool,
}

impl Pager {
    pub(crate) fn new(backend: Arc<dyn TableBackend>, table: String, options: QueryOptions) -> Self {
        Self {
            backend,
            table,
            options,
            continuation: None,
            exhausted: false,
        }
    }

    /// Whether another `next_page` call could yield a page.
    pub fn more(&self) -> bool {
        !self.exhausted
    }

    /// Fetch the next page, or `None` once the sequence is drained.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }

        let fetched = self
            .backend
            .query_entities(&self.table, &self.options, self.continuation.as_ref())
            .await;

        let page = match fetched {
            Ok(page) => page,
            Err(err) => {
                // A failed fetch ends the sequence; the pager is not retryable.
                self.exhausted = true;
                return Err(err);
            }
        };

        debug!(
            table = %self.table,
            entities = page.entities.len(),
            has_more = page.continuation.is_some(),
            "fetched query page"
        );

        self.continuation = page.continuation;
        if self.continuation.is_none() {
            self.exhausted = true;
        }

        Ok(Some(Page {
            entities: page.entities,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EdmValue, TableEntity};
    use crate::memory::MemoryBackend;

    async fn seeded_backend(rows: usize) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_table("stock").await.unwrap();
        for i in 0..rows {
            let mut entity = TableEntity::new("pencils", format!("{:03}", i)).unwrap();
            entity
                .insert("Product", EdmValue::String("Ticonderoga Pencils".into()))
                .unwrap();
            backend.insert_entity("stock", &entity).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn drains_in_capped_pages() {
        let backend = seeded_backend(40).await;
        let options = QueryOptions::new().top(15);
        let mut pager = Pager::new(backend, "stock".into(), options);

        let mut sizes = Vec::new();
        while let Some(page) = pager.next_page().await.unwrap() {
            sizes.push(page.entities.len());
        }

        assert_eq!(sizes, vec![15, 15, 10]);
        assert!(!pager.more());
        // Drained pagers keep returning None.
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_short_page_when_under_cap() {
        let backend = seeded_backend(4).await;
        let mut pager = Pager::new(backend, "stock".into(), QueryOptions::new().top(15));

        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page.entities.len(), 4);
        assert!(!pager.more());
    }

    #[tokio::test]
    async fn missing_table_ends_the_sequence() {
        let backend = Arc::new(MemoryBackend::new());
        let mut pager = Pager::new(backend, "nope".into(), QueryOptions::new());

        assert!(pager.next_page().await.is_err());
        assert!(!pager.more());
        assert!(pager.next_page().await.unwrap().is_none());
    }
}
