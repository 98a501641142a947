//! table-probe: a smoke harness for Azure-Tables-compatible emulators.
//!
//! Layers:
//! 1. entity/batch/query: the data model (typed EDM properties, single
//!    partition batches, paged queries)
//! 2. backend: the seam between the facade and a store
//! 3. rest / memory: the wire client and an in-process stand-in
//! 4. client: service and table handles
//! 5. harness: the sequential smoke scenario the binary runs

pub mod backend;
pub mod batch;
pub mod client;
pub mod connection;
pub mod entity;
pub mod error;
pub mod harness;
pub mod memory;
pub mod query;
pub mod rest;

pub use batch::{Batch, BatchOperation, BatchResponse, BatchResult};
pub use client::{TableClient, TableServiceClient};
pub use connection::{ConnectionString, EMULATOR_CONNECTION_STRING};
pub use entity::{EdmValue, TableEntity};
pub use error::{Result, TableError};
pub use memory::MemoryBackend;
pub use query::{Page, Pager, QueryOptions};
