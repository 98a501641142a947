//! Test driver: the sequential smoke scenario run against the emulator.
//!
//! Connect, create a uniquely named table, insert ten entities one at a
//! time, run a three-operation batch against a second table (creating it
//! lazily on the first failure), then drain a filtered, projected, paged
//! query and print what came back. Every error is fatal except the single
//! table-missing recovery in the batch step.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{Batch, BatchResult};
use crate::client::{TableClient, TableServiceClient};
use crate::entity::{EdmValue, TableEntity};
use crate::error::{Result, TableError};
use crate::query::QueryOptions;

/// Entities inserted individually in the simple-insert phase.
pub const SIMPLE_INSERT_COUNT: usize = 10;

const PENCIL_PARTITION: &str = "pencils";
const PENCILS_FILTER: &str = "PartitionKey eq 'pencils'";
const QUERY_PAGE_SIZE: u32 = 15;

/// Outcome of a full run, for CI assertions on top of the printed output.
#[derive(Debug)]
pub struct RunReport {
    pub table_name: String,
    pub batch_table_name: String,
    pub page_sizes: Vec<usize>,
    pub total_entities: usize,
}

/// A collision-free table name: letter prefix plus a hyphenless UUID.
pub fn unique_table_name(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

/// The fixed pencil entity used by the simple-insert phase: one property of
/// every supported kind.
pub fn pencil_entity(row: usize) -> Result<TableEntity> {
    let mut entity = TableEntity::new(PENCIL_PARTITION, row.to_string())?;
    entity.insert("Product", EdmValue::String("Ticonderoga Pencils".into()))?;
    entity.insert("Price", EdmValue::Double(5.00))?;
    entity.insert("Count", EdmValue::Int64(12_345_678_901_234))?;
    entity.insert("ProductGuid", EdmValue::Guid(Uuid::new_v4()))?;
    entity.insert("DateReceived", EdmValue::DateTime(Utc::now()))?;
    entity.insert(
        "ProductCode",
        EdmValue::Binary(Bytes::from_static(b"somebinaryvalue")),
    )?;
    Ok(entity)
}

/// The fixed three-operation batch: a plain insert, an insert-or-replace,
/// and an insert-or-merge, all in partition "1", the upserts echoing.
pub fn sample_batch() -> Result<Batch> {
    let mut batch = Batch::new();
    batch.insert(TableEntity::new("1", "rowkey1")?)?;
    batch.insert_or_replace(TableEntity::new("1", "rowkey2")?, true)?;

    let mut merged = TableEntity::new("1", "3")?;
    merged.insert("AmountDue", EdmValue::Double(200.23))?;
    merged.insert("CustomerCode", EdmValue::String("123".into()))?;
    merged.insert(
        "CustomerSince",
        EdmValue::DateTime(parse_timestamp("1992-12-20T21:55:00Z")?),
    )?;
    merged.insert("IsActive", EdmValue::Boolean(true))?;
    merged.insert("NumberOfOrders", EdmValue::Int64(255))?;
    batch.insert_or_merge(merged, true)?;

    Ok(batch)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| TableError::Validation(format!("bad timestamp {}: {}", raw, e)))
}

/// Insert the pencil entities one request at a time. Returns what was sent
/// so callers can compare against what a later query returns. Any single
/// failure aborts the phase.
pub async fn insert_simple(table: &TableClient) -> Result<Vec<TableEntity>> {
    let mut inserted = Vec::with_capacity(SIMPLE_INSERT_COUNT);
    for row in 0..SIMPLE_INSERT_COUNT {
        let entity = pencil_entity(row)?;
        table.add_entity(&entity).await?;
        inserted.push(entity);
    }
    info!(table = table.name(), count = inserted.len(), "simple inserts done");
    Ok(inserted)
}

/// Submit a batch, establishing its table lazily: on a table-missing
/// failure, create the table and resubmit the same batch exactly once.
/// Any other error, or a second failure, propagates to the caller.
pub async fn submit_with_table_recovery(
    client: &TableClient,
    batch: &Batch,
) -> Result<BatchResult> {
    match client.submit_batch(batch).await {
        Ok(result) => Ok(result),
        Err(err) if err.is_table_missing() => {
            warn!(table = client.name(), "table missing, creating it and retrying the batch");
            client.create().await?;
            client.submit_batch(batch).await
        }
        Err(err) => Err(err),
    }
}

/// Drain the pencils query page by page, printing per-page counts and the
/// projected fields of every entity. Returns the page sizes.
async fn drain_query(table: &TableClient) -> Result<Vec<usize>> {
    let options = QueryOptions::new()
        .filter(PENCILS_FILTER)
        .select(["RowKey", "Value", "Product", "Available"])
        .top(QUERY_PAGE_SIZE);

    let mut pager = table.list_entities(options);
    let mut page_sizes = Vec::new();

    while let Some(page) = pager.next_page().await? {
        println!(
            "There are {} entities in page #{}",
            page.entities.len(),
            page_sizes.len()
        );
        for entity in &page.entities {
            println!(
                "Received: {}, {}, {}, {}",
                entity.row_key(),
                display_property(entity, "Value"),
                display_property(entity, "Product"),
                display_property(entity, "Available"),
            );
        }
        page_sizes.push(page.entities.len());
    }

    Ok(page_sizes)
}

fn display_property(entity: &TableEntity, name: &str) -> String {
    match entity.property(name) {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

/// Run the whole scenario. States are strictly sequential; the first error
/// anywhere outside the sanctioned batch recovery aborts the run.
pub async fn run(service: &TableServiceClient) -> Result<RunReport> {
    let table_name = unique_table_name(PENCIL_PARTITION);
    let batch_table_name = unique_table_name("batchprobe");

    println!("▶ Creating table {}...", table_name);
    let table = service.create_table(&table_name).await?;
    println!("✓ Table created\n");

    println!("▶ Inserting {} entities individually...", SIMPLE_INSERT_COUNT);
    let inserted = insert_simple(&table).await?;
    println!("✓ Inserted {} entities\n", inserted.len());

    let batch = sample_batch()?;
    println!("▶ Executing a {}-operation batch against {}...", batch.len(), batch_table_name);
    let batch_client = service.table_client(&batch_table_name);
    let result = submit_with_table_recovery(&batch_client, &batch).await?;
    println!("✓ Batch committed {} operations\n", result.responses.len());

    println!("▶ Querying {} (filter: {}, top {})...", table_name, PENCILS_FILTER, QUERY_PAGE_SIZE);
    let page_sizes = drain_query(&table).await?;
    let total_entities = page_sizes.iter().sum();
    println!("✓ Query drained: {} entities over {} pages\n", total_entities, page_sizes.len());

    Ok(RunReport {
        table_name,
        batch_table_name,
        page_sizes,
        total_entities,
    })
}
