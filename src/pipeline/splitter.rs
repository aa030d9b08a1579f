//! Page to delete-batch splitting.

use super::query::Page;
use super::Metrics;
use crate::model::{DeleteBatch, ItemKey, BATCH_WRITE_LIMIT};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Split one page of keys into contiguous batches of at most
/// [`BATCH_WRITE_LIMIT`] keys, preserving key order.
pub fn split_page(table_name: &str, keys: Vec<ItemKey>) -> Vec<DeleteBatch> {
    let mut batches = Vec::with_capacity(keys.len().div_ceil(BATCH_WRITE_LIMIT));
    let mut keys = keys.into_iter().peekable();

    while keys.peek().is_some() {
        let chunk: Vec<ItemKey> = keys.by_ref().take(BATCH_WRITE_LIMIT).collect();
        // peek() guarantees at least one key, take() at most the limit
        batches.push(DeleteBatch::from_chunk(table_name, chunk));
    }
    batches
}

/// Split `page` and feed its batches into the request conduit.
///
/// Returns the batches the conduit refused because the executor is gone,
/// so they can be reported as not deleted.
pub async fn dispatch_page(
    table_name: String,
    page: Page,
    requests: mpsc::Sender<DeleteBatch>,
    metrics: Arc<Metrics>,
) -> Vec<DeleteBatch> {
    let batches = split_page(&table_name, page.keys);
    tracing::debug!(page = page.number, batches = batches.len(), "Page split into batches");

    let mut undelivered = Vec::new();
    let mut batches = batches.into_iter();
    for batch in batches.by_ref() {
        match requests.send(batch).await {
            Ok(()) => metrics.add_batch_dispatched(),
            Err(mpsc::error::SendError(batch)) => {
                tracing::warn!(page = page.number, "Request conduit closed, batches left undelivered");
                undelivered.push(batch);
                break;
            }
        }
    }
    undelivered.extend(batches);
    undelivered
}
