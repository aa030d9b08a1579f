//! Data types that flow through a partition deletion.
//!
//! Each value is created by one stage and handed downstream through a conduit;
//! nothing here is mutated after construction except [`DeletionSummary`],
//! which only the aggregator owns.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maximum number of write operations the store accepts in one batch call.
pub const BATCH_WRITE_LIMIT: usize = 25;

/// Scalar value of a key attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// String
    S(String),
    /// Number, kept in its wire (decimal string) form
    N(String),
    /// Binary
    B(Vec<u8>),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::S(s) => write!(f, "{s}"),
            KeyValue::N(n) => write!(f, "{n}"),
            KeyValue::B(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Raw attribute map as returned by a store.
pub type AttributeMap = HashMap<String, KeyValue>;

/// Role of an attribute in a key schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Partition,
    Sort,
}

/// One element of a table's key schema as described by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchemaElement {
    pub attribute_name: String,
    pub role: KeyRole,
}

impl KeySchemaElement {
    pub fn partition(name: impl Into<String>) -> Self {
        Self {
            attribute_name: name.into(),
            role: KeyRole::Partition,
        }
    }

    pub fn sort(name: impl Into<String>) -> Self {
        Self {
            attribute_name: name.into(),
            role: KeyRole::Sort,
        }
    }
}

/// Resolved primary key of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableKeySchema {
    pub table_name: String,
    pub partition_key: String,
    pub range_key: Option<String>,
}

impl TableKeySchema {
    pub fn has_range_key(&self) -> bool {
        self.range_key.is_some()
    }

    /// Attributes a query must project to rebuild an item's key.
    pub fn projection(&self) -> Vec<String> {
        let mut attributes = vec![self.partition_key.clone()];
        if let Some(range_key) = &self.range_key {
            attributes.push(range_key.clone());
        }
        attributes
    }
}

/// Reason an attribute map could not become an [`ItemKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("item is missing partition key attribute `{0}`")]
    MissingPartitionKey(String),

    #[error("item is missing sort key attribute `{0}`")]
    MissingSortKey(String),
}

/// Key of one matched item: the partition key and, when the table has one,
/// the sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    partition: (String, KeyValue),
    sort: Option<(String, KeyValue)>,
}

impl ItemKey {
    /// Build a key from a raw attribute map, validated against `schema`.
    ///
    /// Attributes that are not part of the primary key are dropped.
    pub fn from_attributes(
        schema: &TableKeySchema,
        mut attributes: AttributeMap,
    ) -> Result<Self, KeyError> {
        let partition_value = attributes
            .remove(&schema.partition_key)
            .ok_or_else(|| KeyError::MissingPartitionKey(schema.partition_key.clone()))?;

        let sort = match &schema.range_key {
            Some(range_key) => {
                let value = attributes
                    .remove(range_key)
                    .ok_or_else(|| KeyError::MissingSortKey(range_key.clone()))?;
                Some((range_key.clone(), value))
            }
            None => None,
        };

        Ok(Self {
            partition: (schema.partition_key.clone(), partition_value),
            sort,
        })
    }

    /// Number of attributes in the key (1 or 2).
    pub fn attribute_count(&self) -> usize {
        1 + usize::from(self.sort.is_some())
    }

    pub fn partition(&self) -> (&str, &KeyValue) {
        (&self.partition.0, &self.partition.1)
    }

    pub fn sort(&self) -> Option<(&str, &KeyValue)> {
        self.sort.as_ref().map(|(name, value)| (name.as_str(), value))
    }

    /// Key attributes as `(name, value)` pairs, partition key first.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        std::iter::once(self.partition()).chain(self.sort())
    }

    pub fn to_attribute_map(&self) -> AttributeMap {
        self.attributes()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.partition.0, self.partition.1)?;
        if let Some((name, value)) = &self.sort {
            write!(f, ", {name}={value}")?;
        }
        Ok(())
    }
}

/// Opaque pagination cursor handed back by the store after a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(pub BTreeMap<String, KeyValue>);

impl From<AttributeMap> for PageCursor {
    fn from(attributes: AttributeMap) -> Self {
        Self(attributes.into_iter().collect())
    }
}

/// Key-conditioned query for every item of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionQuery {
    pub table_name: String,
    pub partition_key: String,
    /// Matched with an equality condition, always as a string scalar.
    pub partition_value: String,
    pub projection: Vec<String>,
    pub page_size: Option<u32>,
}

impl PartitionQuery {
    pub fn for_partition(
        schema: &TableKeySchema,
        partition_value: impl Into<String>,
        page_size: Option<u32>,
    ) -> Self {
        Self {
            table_name: schema.table_name.clone(),
            partition_key: schema.partition_key.clone(),
            partition_value: partition_value.into(),
            projection: schema.projection(),
            page_size,
        }
    }
}

/// One page of raw query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<AttributeMap>,
    pub consumed_capacity_units: f64,
    pub next_cursor: Option<PageCursor>,
}

/// Batch size outside `1..=BATCH_WRITE_LIMIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("delete batch must hold 1..={BATCH_WRITE_LIMIT} keys, got {0}")]
pub struct BatchSizeError(pub usize);

/// Up to [`BATCH_WRITE_LIMIT`] delete operations against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBatch {
    table_name: String,
    keys: Vec<ItemKey>,
}

impl DeleteBatch {
    pub fn new(table_name: impl Into<String>, keys: Vec<ItemKey>) -> Result<Self, BatchSizeError> {
        if keys.is_empty() || keys.len() > BATCH_WRITE_LIMIT {
            return Err(BatchSizeError(keys.len()));
        }
        Ok(Self::from_chunk(table_name, keys))
    }

    /// Build a batch from a chunk already known to hold
    /// 1..=[`BATCH_WRITE_LIMIT`] keys.
    pub(crate) fn from_chunk(table_name: impl Into<String>, keys: Vec<ItemKey>) -> Self {
        debug_assert!(!keys.is_empty() && keys.len() <= BATCH_WRITE_LIMIT);
        Self {
            table_name: table_name.into(),
            keys,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn keys(&self) -> &[ItemKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn into_keys(self) -> Vec<ItemKey> {
        self.keys
    }
}

/// Outcome of one executed batch-delete call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Deleted item count per table.
    pub item_collection_metrics: HashMap<String, u64>,
    pub consumed_capacity_units: f64,
    /// Keys the store accepted but handed back without deleting them.
    pub unprocessed: Vec<ItemKey>,
}

impl BatchResult {
    pub fn deleted_items(&self) -> u64 {
        self.item_collection_metrics.values().sum()
    }

    pub fn unprocessed_items(&self) -> u64 {
        self.unprocessed.len() as u64
    }
}

/// Caller-supplied scope of one deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRequest {
    pub table_name: String,
    pub partition_value: String,
}

impl DeletionRequest {
    pub fn new(table_name: impl Into<String>, partition_value: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            partition_value: partition_value.into(),
        }
    }

    /// Both fields are mandatory and may not be blank.
    pub fn validate(&self) -> Result<(), String> {
        if self.table_name.trim().is_empty() {
            return Err("table name must not be empty".to_string());
        }
        if self.partition_value.is_empty() {
            return Err("partition value must not be empty".to_string());
        }
        Ok(())
    }
}

/// Totals reported once the result conduit has drained.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionSummary {
    pub total_items_deleted: u64,
    pub total_consumed_capacity_units: f64,
    pub total_unprocessed_items: u64,
    pub batches_executed: u64,
}

impl DeletionSummary {
    pub fn absorb(&mut self, result: &BatchResult) {
        self.total_items_deleted += result.deleted_items();
        self.total_consumed_capacity_units += result.consumed_capacity_units;
        self.total_unprocessed_items += result.unprocessed_items();
        self.batches_executed += 1;
    }
}

impl fmt::Display for DeletionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Deleted: {} items in {} batches | Unprocessed: {} | Capacity: {:.1} WCU",
            self.total_items_deleted,
            self.batches_executed,
            self.total_unprocessed_items,
            self.total_consumed_capacity_units
        )
    }
}

/// Correlation and cancellation context threaded through every remote call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("request", request_id = %self.request_id)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
