//! End-to-end pipeline tests against the in-memory store.

use super::{Pipeline, PipelineConfig};
use crate::error::{DeleteError, StoreError};
use crate::model::{
    AttributeMap, BatchResult, DeleteBatch, DeletionRequest, KeySchemaElement, KeyValue,
    PageCursor, PartitionQuery, QueryPage, RequestContext,
};
use crate::pipeline::Metrics;
use crate::store::{MemoryStore, PartitionStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

fn order(customer: &str, order: usize) -> AttributeMap {
    AttributeMap::from([
        ("CustomerId".to_string(), KeyValue::S(customer.to_string())),
        ("OrderId".to_string(), KeyValue::S(format!("O-{order:04}"))),
        ("Total".to_string(), KeyValue::N("99.5".to_string())),
    ])
}

/// `Orders` keyed by `CustomerId` and `OrderId`, with an unrelated index key
/// schema listed after the primary key.
fn orders_store(customer: &str, count: usize) -> MemoryStore {
    MemoryStore::new()
        .with_table(
            "Orders",
            vec![
                KeySchemaElement::partition("CustomerId"),
                KeySchemaElement::sort("OrderId"),
                KeySchemaElement::partition("Status"),
            ],
        )
        .with_items("Orders", (0..count).map(|i| order(customer, i)))
        .with_items("Orders", (0..7).map(|i| order("C-999", i)))
}

fn pipeline(store: &Arc<MemoryStore>) -> Pipeline {
    Pipeline::new(store.clone(), Metrics::new(), PipelineConfig::default())
}

fn sorted(mut sizes: Vec<usize>) -> Vec<usize> {
    sizes.sort_unstable();
    sizes
}

#[tokio::test]
async fn test_two_pages_never_share_a_batch() {
    let store = Arc::new(orders_store("C-100", 30).with_page_sizes("Orders", vec![20, 10]));
    let pipeline = pipeline(&store);

    let summary = pipeline
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(summary.total_items_deleted, 30);
    assert_eq!(summary.batches_executed, 2);
    assert_eq!(sorted(store.batch_sizes()), vec![10, 20]);
    assert_eq!(store.query_calls("Orders"), 2);
    // Only the other customer's orders remain
    assert_eq!(store.item_count("Orders"), 7);

    let metrics = pipeline.metrics().snapshot();
    assert_eq!(metrics.pages_fetched, 2);
    assert_eq!(metrics.items_matched, 30);
    assert_eq!(metrics.batches_dispatched, 2);
    assert_eq!(metrics.items_deleted, 30);
}

#[tokio::test]
async fn test_missing_table_fails_before_query() {
    let store = Arc::new(MemoryStore::new());

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    assert!(err.is_schema_lookup_failure());
    assert!(matches!(err, DeleteError::TableNotFound { .. }));
    assert_eq!(store.batch_calls(), 0);
}

#[tokio::test]
async fn test_describe_failure_fails_before_query() {
    let store = Arc::new(
        orders_store("C-100", 30).fail_describe(StoreError::Unavailable("timeout".into())),
    );

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeleteError::SchemaLookupFailed { .. }));
    assert_eq!(store.query_calls("Orders"), 0);
    assert_eq!(store.item_count("Orders"), 37);
}

#[tokio::test]
async fn test_second_of_three_batches_fails() {
    let store = Arc::new(
        orders_store("C-100", 60).fail_batch_call(2, StoreError::Throttled("slow down".into())),
    );

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    let (batch, progress) = match err {
        DeleteError::BatchDeleteFailed {
            batch, progress, ..
        } => (batch, progress),
        other => panic!("expected batch delete failure, got {other:?}"),
    };
    assert_eq!(batch, 2);
    // Batch 3 was never sent
    assert_eq!(store.batch_calls(), 2);
    assert_eq!(progress.summary.total_items_deleted, 25);
    assert_eq!(progress.summary.batches_executed, 1);
    assert_eq!(progress.unexecuted.len(), 2);
    assert_eq!(progress.unexecuted_key_count(), 35);
    assert_eq!(store.item_count("Orders"), 35 + 7);
}

#[tokio::test]
async fn test_table_without_sort_key() {
    let store = Arc::new(
        MemoryStore::new()
            .with_table("Customers", vec![KeySchemaElement::partition("Id")])
            .with_items(
                "Customers",
                ["A", "B"].map(|id| {
                    AttributeMap::from([
                        ("Id".to_string(), KeyValue::S(id.to_string())),
                        ("Name".to_string(), KeyValue::S("n".to_string())),
                    ])
                }),
            ),
    );

    let summary = pipeline(&store)
        .run(&DeletionRequest::new("Customers", "A"), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(summary.total_items_deleted, 1);
    assert_eq!(store.batch_sizes(), vec![1]);
    assert_eq!(store.item_count("Customers"), 1);
}

#[tokio::test]
async fn test_one_batch_in_flight() {
    let store = Arc::new(
        orders_store("C-100", 200)
            .with_page_sizes("Orders", vec![30; 7])
            .with_latency(Duration::from_millis(1)),
    );

    let summary = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(summary.total_items_deleted, 200);
    assert_eq!(store.max_concurrent_batches(), 1);
    assert!(store.batch_sizes().iter().all(|&size| size <= 25));
    // Each 30-key page splits into 25 + 5, the 20-key tail into one batch
    assert_eq!(store.batch_calls(), 6 * 2 + 1);
}

#[tokio::test]
async fn test_conduit_capacity_does_not_change_result() {
    for buffer in [1, 2, 16] {
        let store = Arc::new(orders_store("C-100", 130).with_page_sizes("Orders", vec![50; 3]));
        let config = PipelineConfig {
            request_buffer: buffer,
            result_buffer: buffer,
            page_size: None,
        };

        let summary = Pipeline::new(store.clone(), Metrics::new(), config)
            .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(summary.total_items_deleted, 130, "buffer {buffer}");
        assert_eq!(summary.batches_executed, 6, "buffer {buffer}");
    }
}

#[tokio::test]
async fn test_empty_partition() {
    let store = Arc::new(orders_store("C-100", 5));

    let summary = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-404"), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(summary.total_items_deleted, 0);
    assert_eq!(summary.batches_executed, 0);
    assert_eq!(store.batch_calls(), 0);
}

#[tokio::test]
async fn test_query_page_failure() {
    let store = Arc::new(
        orders_store("C-100", 30)
            .with_page_sizes("Orders", vec![20, 10])
            .fail_query_page(2, StoreError::Unavailable("connection reset".into())),
    );

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    let (page, progress) = match err {
        DeleteError::QueryPageFailed { page, progress, .. } => (page, progress),
        other => panic!("expected query page failure, got {other:?}"),
    };
    assert_eq!(page, 2);
    // Page 1 was either deleted before the abort or reported as unexecuted
    assert_eq!(
        progress.summary.total_items_deleted as usize + progress.unexecuted_key_count(),
        20
    );
}

#[tokio::test]
async fn test_cancel_before_start() {
    let store = Arc::new(orders_store("C-100", 30));
    let ctx = RequestContext::new();
    ctx.cancel.cancel();

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, DeleteError::Cancelled { .. }));
    assert_eq!(store.query_calls("Orders"), 0);
    assert_eq!(store.batch_calls(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let store = Arc::new(
        orders_store("C-100", 500)
            .with_page_sizes("Orders", vec![25; 20])
            .with_latency(Duration::from_millis(20)),
    );
    let ctx = RequestContext::new();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", "C-100"), &ctx)
        .await
        .unwrap_err();

    let progress = match err {
        DeleteError::Cancelled { progress } => progress,
        other => panic!("expected cancellation, got {other:?}"),
    };
    let deleted = progress.summary.total_items_deleted as usize;
    assert!(deleted < 500);
    assert_eq!(store.item_count("Orders"), 500 - deleted + 7);
    assert!(progress.unexecuted_key_count() <= 500 - deleted);
}

#[tokio::test]
async fn test_invalid_request() {
    let store = Arc::new(orders_store("C-100", 1));

    let err = pipeline(&store)
        .run(&DeletionRequest::new("Orders", ""), &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeleteError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_analyze_does_not_delete() {
    let store = Arc::new(orders_store("C-100", 60).with_page_sizes("Orders", vec![40, 20]));

    let analysis = pipeline(&store)
        .analyze(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(analysis.pages, 2);
    assert_eq!(analysis.items, 60);
    // 40 -> 25 + 15, 20 -> 20
    assert_eq!(analysis.batches, 3);
    assert_eq!(analysis.key_schema.range_key.as_deref(), Some("OrderId"));
    assert_eq!(store.batch_calls(), 0);
    assert_eq!(store.item_count("Orders"), 67);
}

#[tokio::test]
async fn test_unprocessed_keys_fail_the_request() {
    let store = Arc::new(
        orders_store("C-100", 30)
            .with_page_sizes("Orders", vec![20, 10])
            .with_unprocessed(1, 5)
            .with_unprocessed(2, 5),
    );
    let pipeline = pipeline(&store);

    let err = pipeline
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    let progress = match err {
        DeleteError::Incomplete { progress } => progress,
        other => panic!("expected incomplete deletion, got {other:?}"),
    };
    assert_eq!(progress.summary.total_items_deleted, 20);
    assert_eq!(progress.summary.total_unprocessed_items, 10);
    assert_eq!(progress.summary.batches_executed, 2);
    assert!(progress.unexecuted.is_empty());
    assert_eq!(progress.unprocessed.len(), 10);
    assert_eq!(progress.remaining_key_count(), 10);
    // The surviving keys are exactly the ones reported
    assert_eq!(store.item_count("Orders"), 10 + 7);
    assert!(progress
        .unprocessed
        .iter()
        .all(|key| key.partition().1 == &KeyValue::S("C-100".to_string())));

    let metrics = pipeline.metrics().snapshot();
    assert_eq!(metrics.items_deleted, 20);
    assert_eq!(metrics.items_unprocessed, 10);
}

/// Delegates reads to a `MemoryStore` and panics on every batch delete.
struct PanickingDeletes(MemoryStore);

#[async_trait]
impl PartitionStore for PanickingDeletes {
    async fn describe_key_schema(
        &self,
        table_name: &str,
    ) -> Result<Vec<KeySchemaElement>, StoreError> {
        self.0.describe_key_schema(table_name).await
    }

    async fn query_page(
        &self,
        query: &PartitionQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<QueryPage, StoreError> {
        self.0.query_page(query, cursor).await
    }

    async fn batch_delete(&self, _batch: &DeleteBatch) -> Result<BatchResult, StoreError> {
        panic!("connection pool poisoned");
    }
}

#[tokio::test]
async fn test_executor_panic_is_reported() {
    let store = Arc::new(PanickingDeletes(
        orders_store("C-100", 80).with_page_sizes("Orders", vec![20; 4]),
    ));

    let err = Pipeline::new(store, Metrics::new(), PipelineConfig::default())
        .run(&DeletionRequest::new("Orders", "C-100"), &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DeleteError::WorkerPanicked { stage: "executor", .. }));
}
