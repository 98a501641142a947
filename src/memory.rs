//! In-process table store with the same observable semantics as the real
//! service: conflict and not-found errors, all-or-nothing batches, and
//! (partition key, row key) ordered paged queries.
//!
//! This is what the test suite runs against in place of a live emulator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::{Continuation, QueryPage, TableBackend};
use crate::batch::{BatchOperation, BatchResponse, BatchResult};
use crate::entity::{EdmValue, TableEntity};
use crate::error::{Result, TableError};
use crate::query::QueryOptions;

/// Service default when the query sets no page cap.
const DEFAULT_PAGE_SIZE: usize = 1000;

type Rows = BTreeMap<(String, String), TableEntity>;

pub struct MemoryBackend {
    tables: DashMap<String, Rows>,
    /// Every create_table call, in order. Lets tests assert how many
    /// creations a recovery path actually performed.
    created: RwLock<Vec<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            created: RwLock::new(Vec::new()),
        }
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn entity(&self, table: &str, partition_key: &str, row_key: &str) -> Option<TableEntity> {
        self.tables
            .get(table)?
            .get(&(partition_key.to_string(), row_key.to_string()))
            .cloned()
    }

    /// Number of create_table calls seen for this table name.
    pub fn create_calls(&self, table: &str) -> usize {
        self.created.read().iter().filter(|name| *name == table).count()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() >= 3 && name.len() <= 63 && name.chars().all(|c| c.is_ascii_alphanumeric())
}

#[async_trait]
impl TableBackend for MemoryBackend {
    async fn create_table(&self, table: &str) -> Result<()> {
        if !valid_table_name(table) {
            return Err(TableError::Validation(format!(
                "invalid table name: {}",
                table
            )));
        }

        self.created.write().push(table.to_string());

        match self.tables.entry(table.to_string()) {
            Entry::Occupied(_) => Err(TableError::Conflict {
                resource: format!("table {}", table),
            }),
            Entry::Vacant(slot) => {
                slot.insert(BTreeMap::new());
                debug!(table, "created table");
                Ok(())
            }
        }
    }

    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> Result<()> {
        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        let key = (
            entity.partition_key().to_string(),
            entity.row_key().to_string(),
        );
        if rows.contains_key(&key) {
            return Err(TableError::Conflict {
                resource: format!("entity ('{}', '{}')", key.0, key.1),
            });
        }

        rows.insert(key, entity.clone());
        Ok(())
    }

    async fn submit_batch(
        &self,
        table: &str,
        operations: &[BatchOperation],
    ) -> Result<BatchResult> {
        if operations.is_empty() {
            return Err(TableError::Validation("batch has no operations".into()));
        }
        let partition = operations[0].entity().partition_key();
        if operations
            .iter()
            .any(|op| op.entity().partition_key() != partition)
        {
            return Err(TableError::Validation(
                "batch operations must share one partition key".into(),
            ));
        }

        let mut rows = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        // Stage every operation against a copy so a mid-batch failure leaves
        // the table untouched.
        let mut staged = rows.clone();
        let mut responses = Vec::with_capacity(operations.len());

        for op in operations {
            let entity = op.entity();
            let key = (
                entity.partition_key().to_string(),
                entity.row_key().to_string(),
            );
            match op {
                BatchOperation::Insert { entity } => {
                    if staged.contains_key(&key) {
                        return Err(TableError::Conflict {
                            resource: format!("entity ('{}', '{}')", key.0, key.1),
                        });
                    }
                    staged.insert(key.clone(), entity.clone());
                    responses.push(BatchResponse {
                        row_key: entity.row_key().to_string(),
                        echoed: None,
                    });
                }
                BatchOperation::InsertOrReplace { entity, echo } => {
                    staged.insert(key.clone(), entity.clone());
                    responses.push(BatchResponse {
                        row_key: entity.row_key().to_string(),
                        echoed: echo.then(|| entity.clone()),
                    });
                }
                BatchOperation::InsertOrMerge { entity, echo } => {
                    let merged = match staged.get_mut(&key) {
                        Some(existing) => {
                            existing.merge_from(entity);
                            existing.clone()
                        }
                        None => {
                            staged.insert(key.clone(), entity.clone());
                            entity.clone()
                        }
                    };
                    responses.push(BatchResponse {
                        row_key: entity.row_key().to_string(),
                        echoed: echo.then_some(merged),
                    });
                }
            }
        }

        *rows = staged;
        debug!(table, operations = operations.len(), "batch committed");
        Ok(BatchResult { responses })
    }

    async fn query_entities(
        &self,
        table: &str,
        options: &QueryOptions,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;

        let comparison = options
            .filter
            .as_deref()
            .map(parse_filter)
            .transpose()?;

        let cap = match options.top {
            Some(0) => {
                return Err(TableError::Validation("top must be positive".into()));
            }
            Some(n) => n as usize,
            None => DEFAULT_PAGE_SIZE,
        };

        let start = continuation.map(|c| {
            (
                c.next_partition_key.clone(),
                c.next_row_key.clone(),
            )
        });

        let mut entities = Vec::new();
        let mut next = None;

        for (key, entity) in rows.iter() {
            if let Some(start) = &start {
                if key < start {
                    continue;
                }
            }
            if !matches_filter(comparison.as_ref(), entity) {
                continue;
            }
            if entities.len() == cap {
                next = Some(Continuation {
                    next_partition_key: key.0.clone(),
                    next_row_key: key.1.clone(),
                });
                break;
            }

            let mut projected = entity.clone();
            if let Some(select) = &options.select {
                projected.project(select);
            }
            entities.push(projected);
        }

        Ok(QueryPage {
            entities,
            continuation: next,
        })
    }
}

/// A parsed `Field eq 'value'` comparison, the whole supported grammar.
#[derive(Debug, PartialEq, Eq)]
struct FilterComparison {
    field: String,
    value: String,
}

fn parse_filter(filter: &str) -> Result<FilterComparison> {
    let bad = |detail: &str| TableError::Validation(format!("filter {:?}: {}", filter, detail));

    let mut parts = filter.trim().splitn(3, char::is_whitespace);
    let field = parts.next().unwrap_or_default();
    let op = parts.next().unwrap_or_default();
    let literal = parts.next().unwrap_or_default().trim();

    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(bad("expected a property name"));
    }
    if op != "eq" {
        return Err(bad("only 'eq' comparisons are supported"));
    }
    if literal.len() < 2 || !literal.starts_with('\'') || !literal.ends_with('\'') {
        return Err(bad("expected a quoted string literal"));
    }

    // Inside the literal, '' encodes one quote.
    let inner = &literal[1..literal.len() - 1];
    let mut value = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\'' {
            match chars.next() {
                Some('\'') => value.push('\''),
                _ => return Err(bad("unbalanced quote in literal")),
            }
        } else {
            value.push(c);
        }
    }

    Ok(FilterComparison {
        field: field.to_string(),
        value,
    })
}

fn matches_filter(comparison: Option<&FilterComparison>, entity: &TableEntity) -> bool {
    let Some(comparison) = comparison else {
        return true;
    };
    match comparison.field.as_str() {
        "PartitionKey" => entity.partition_key() == comparison.value,
        "RowKey" => entity.row_key() == comparison.value,
        name => matches!(
            entity.property(name),
            Some(EdmValue::String(s)) if *s == comparison.value
        ),
    }
}
