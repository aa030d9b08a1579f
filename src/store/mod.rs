//! Remote store access.
//!
//! The pipeline only talks to the store through [`PartitionStore`], which
//! exposes the three primitives a partition deletion needs. The client handle
//! behind it is shared read-only by every stage.

mod dynamodb;
pub mod memory;

pub use dynamodb::{connect, DynamoDbStore};
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::model::{BatchResult, DeleteBatch, KeySchemaElement, PageCursor, PartitionQuery, QueryPage};
use async_trait::async_trait;

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Key schema elements of the table's primary key.
    async fn describe_key_schema(&self, table_name: &str)
        -> Result<Vec<KeySchemaElement>, StoreError>;

    /// Fetch one page of `query`, starting after `cursor`.
    async fn query_page(
        &self,
        query: &PartitionQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<QueryPage, StoreError>;

    /// Delete every key of `batch` in a single call.
    async fn batch_delete(&self, batch: &DeleteBatch) -> Result<BatchResult, StoreError>;
}
