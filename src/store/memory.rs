//! In-process [`PartitionStore`] for tests and local experiments.
//!
//! Items are kept per table and returned in sort-key order, so pagination
//! cursors stay valid while a deletion removes items between pages. Faults
//! can be injected per call number, and every batch call is recorded.

use super::PartitionStore;
use crate::error::StoreError;
use crate::model::{
    AttributeMap, BatchResult, DeleteBatch, KeyRole, KeySchemaElement, KeyValue, PageCursor,
    PartitionQuery, QueryPage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Page size used when neither the table nor the query sets one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

const READ_UNITS_PER_ITEM: f64 = 0.5;
const WRITE_UNITS_PER_ITEM: f64 = 1.0;

#[derive(Debug, Default)]
struct MemoryTable {
    key_schema: Vec<KeySchemaElement>,
    items: Vec<AttributeMap>,
    page_sizes: Vec<usize>,
    query_calls: usize,
}

impl MemoryTable {
    fn key_name(&self, role: KeyRole) -> Option<&str> {
        self.key_schema
            .iter()
            .find(|element| element.role == role)
            .map(|element| element.attribute_name.as_str())
    }

    /// Remove the item matching `key`, if present.
    fn remove(&mut self, key: &AttributeMap) {
        let position = self
            .items
            .iter()
            .position(|item| key.iter().all(|(name, value)| item.get(name) == Some(value)));
        if let Some(position) = position {
            self.items.remove(position);
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    describe: Option<StoreError>,
    query_pages: HashMap<usize, StoreError>,
    batch_calls: HashMap<usize, StoreError>,
    /// Call number to how many trailing keys come back unprocessed
    unprocessed: HashMap<usize, usize>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    faults: Faults,
    batch_calls: usize,
    batch_sizes: Vec<usize>,
}

/// In-memory table store with fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with the key schema elements `describe_key_schema`
    /// will report, in order.
    pub fn with_table(self, table_name: &str, key_schema: Vec<KeySchemaElement>) -> Self {
        self.state.lock().tables.insert(
            table_name.to_string(),
            MemoryTable {
                key_schema,
                ..Default::default()
            },
        );
        self
    }

    pub fn with_items(self, table_name: &str, items: impl IntoIterator<Item = AttributeMap>) -> Self {
        {
            let mut state = self.state.lock();
            let table = state.tables.entry(table_name.to_string()).or_default();
            table.items.extend(items);
        }
        self
    }

    /// Size of each successive page returned for `table_name`.
    pub fn with_page_sizes(self, table_name: &str, page_sizes: Vec<usize>) -> Self {
        self.state
            .lock()
            .tables
            .entry(table_name.to_string())
            .or_default()
            .page_sizes = page_sizes;
        self
    }

    /// Delay every batch-delete call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_describe(self, error: StoreError) -> Self {
        self.state.lock().faults.describe = Some(error);
        self
    }

    /// Fail the `page`-th query call (1-based).
    pub fn fail_query_page(self, page: usize, error: StoreError) -> Self {
        self.state.lock().faults.query_pages.insert(page, error);
        self
    }

    /// Fail the `call`-th batch-delete call (1-based).
    pub fn fail_batch_call(self, call: usize, error: StoreError) -> Self {
        self.state.lock().faults.batch_calls.insert(call, error);
        self
    }

    /// Leave the last `count` keys of the `call`-th batch-delete call
    /// (1-based) in place and hand them back as unprocessed.
    pub fn with_unprocessed(self, call: usize, count: usize) -> Self {
        self.state.lock().faults.unprocessed.insert(call, count);
        self
    }

    pub fn item_count(&self, table_name: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table_name)
            .map_or(0, |table| table.items.len())
    }

    pub fn query_calls(&self, table_name: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table_name)
            .map_or(0, |table| table.query_calls)
    }

    /// Batch-delete calls received, including failed ones.
    pub fn batch_calls(&self) -> usize {
        self.state.lock().batch_calls
    }

    /// Sizes of every successful batch-delete call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    /// Highest number of batch-delete calls observed in flight at once.
    pub fn max_concurrent_batches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn apply_batch(&self, batch: &DeleteBatch) -> Result<BatchResult, StoreError> {
        let mut state = self.state.lock();
        state.batch_calls += 1;
        let call = state.batch_calls;
        if let Some(error) = state.faults.batch_calls.get(&call) {
            return Err(error.clone());
        }

        let State {
            tables,
            faults,
            batch_sizes,
            ..
        } = &mut *state;
        let table = tables
            .get_mut(batch.table_name())
            .ok_or_else(|| StoreError::NotFound(format!("table `{}`", batch.table_name())))?;

        let held_back = faults.unprocessed.get(&call).copied().unwrap_or(0).min(batch.len());
        let (processed, unprocessed) = batch.keys().split_at(batch.len() - held_back);
        for key in processed {
            table.remove(&key.to_attribute_map());
        }
        batch_sizes.push(batch.len());

        Ok(BatchResult {
            item_collection_metrics: HashMap::from([(
                batch.table_name().to_string(),
                processed.len() as u64,
            )]),
            consumed_capacity_units: processed.len() as f64 * WRITE_UNITS_PER_ITEM,
            unprocessed: unprocessed.to_vec(),
        })
    }
}

#[async_trait]
impl PartitionStore for MemoryStore {
    async fn describe_key_schema(
        &self,
        table_name: &str,
    ) -> Result<Vec<KeySchemaElement>, StoreError> {
        let state = self.state.lock();
        if let Some(error) = &state.faults.describe {
            return Err(error.clone());
        }
        state
            .tables
            .get(table_name)
            .map(|table| table.key_schema.clone())
            .ok_or_else(|| StoreError::NotFound(format!("table `{table_name}`")))
    }

    async fn query_page(
        &self,
        query: &PartitionQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<QueryPage, StoreError> {
        let mut state = self.state.lock();
        let State { tables, faults, .. } = &mut *state;
        let table = tables
            .get_mut(&query.table_name)
            .ok_or_else(|| StoreError::NotFound(format!("table `{}`", query.table_name)))?;

        table.query_calls += 1;
        let call = table.query_calls;
        if let Some(error) = faults.query_pages.get(&call) {
            return Err(error.clone());
        }

        let partition_value = KeyValue::S(query.partition_value.clone());
        let sort_key = table.key_name(KeyRole::Sort).map(str::to_string);
        let sort_value = |item: &AttributeMap| -> Option<KeyValue> {
            sort_key.as_ref().and_then(|name| item.get(name).cloned())
        };

        let mut matched: Vec<&AttributeMap> = table
            .items
            .iter()
            .filter(|item| item.get(&query.partition_key) == Some(&partition_value))
            .collect();
        matched.sort_by_key(|item| sort_value(*item));

        if let Some(cursor) = cursor {
            let after = sort_key.as_ref().and_then(|name| cursor.0.get(name).cloned());
            matched.retain(|item| sort_value(*item) > after);
        }

        let page_size = table
            .page_sizes
            .get(call - 1)
            .copied()
            .or(query.page_size.map(|size| size as usize))
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let has_more = matched.len() > page_size;
        let items: Vec<AttributeMap> = matched
            .into_iter()
            .take(page_size)
            .map(|item| {
                query
                    .projection
                    .iter()
                    .filter_map(|name| item.get(name).map(|value| (name.clone(), value.clone())))
                    .collect()
            })
            .collect();

        let next_cursor = if has_more {
            items.last().cloned().map(PageCursor::from)
        } else {
            None
        };

        Ok(QueryPage {
            consumed_capacity_units: (items.len().max(1) as f64) * READ_UNITS_PER_ITEM,
            items,
            next_cursor,
        })
    }

    async fn batch_delete(&self, batch: &DeleteBatch) -> Result<BatchResult, StoreError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = self.apply_batch(batch);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
