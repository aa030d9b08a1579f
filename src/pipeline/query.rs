//! Paginated partition query.

use crate::error::StoreError;
use crate::model::{ItemKey, PageCursor, PartitionQuery, TableKeySchema};
use crate::store::PartitionStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One page of matched item keys.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based position in the page sequence
    pub number: usize,
    pub keys: Vec<ItemKey>,
    pub consumed_capacity_units: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum PageFetchError {
    #[error("page fetch cancelled")]
    Cancelled,

    #[error("query page {page} failed: {source}")]
    Failed {
        page: usize,
        #[source]
        source: StoreError,
    },
}

/// Lazy sequence of pages for one partition.
///
/// Pages are fetched one at a time by following the store's cursor. Once
/// the cursor runs out, or a fetch fails, the stream is exhausted and
/// cannot be restarted.
pub struct PageStream {
    store: Arc<dyn PartitionStore>,
    schema: TableKeySchema,
    query: PartitionQuery,
    cursor: Option<PageCursor>,
    pages_fetched: usize,
    exhausted: bool,
}

impl PageStream {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        schema: TableKeySchema,
        partition_value: &str,
        page_size: Option<u32>,
    ) -> Self {
        let query = PartitionQuery::for_partition(&schema, partition_value, page_size);
        Self {
            store,
            schema,
            query,
            cursor: None,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    pub fn query(&self) -> &PartitionQuery {
        &self.query
    }

    pub fn schema(&self) -> &TableKeySchema {
        &self.schema
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page, or `Ok(None)` once the partition is exhausted.
    ///
    /// `cancel` is checked before the call is issued; a fetch already in
    /// flight runs to completion.
    pub async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Page>, PageFetchError> {
        if self.exhausted {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            self.exhausted = true;
            return Err(PageFetchError::Cancelled);
        }

        let number = self.pages_fetched + 1;
        let page = match self.store.query_page(&self.query, self.cursor.as_ref()).await {
            Ok(page) => page,
            Err(source) => {
                self.exhausted = true;
                tracing::error!(page = number, error = %source, "Query page failed");
                return Err(PageFetchError::Failed { page: number, source });
            }
        };
        self.pages_fetched = number;

        let keys = page
            .items
            .into_iter()
            .map(|item| ItemKey::from_attributes(&self.schema, item))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                self.exhausted = true;
                PageFetchError::Failed {
                    page: number,
                    source: StoreError::MalformedResponse(err.to_string()),
                }
            })?;

        self.cursor = page.next_cursor;
        self.exhausted = self.cursor.is_none();

        tracing::info!(
            page = number,
            items = keys.len(),
            consumed_capacity_units = page.consumed_capacity_units,
            "Number of items for page found"
        );

        Ok(Some(Page {
            number,
            keys,
            consumed_capacity_units: page.consumed_capacity_units,
        }))
    }
}
