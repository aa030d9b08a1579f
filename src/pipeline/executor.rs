//! Single-worker batch executor.
//!
//! The executor is the only consumer of the request conduit and the only
//! writer of the result conduit. It issues one batch-delete call at a time.
//!
//! After a failure (or once the pipeline is aborted) it stops calling the
//! store but keeps draining the request conduit until it closes, collecting
//! every remaining batch as unexecuted. Producers therefore never block on a
//! conduit nobody reads.
//!
//! Keys the store hands back unprocessed from a successful call are not
//! retried; they are collected so the request can report them.

use super::Metrics;
use crate::error::StoreError;
use crate::model::{BatchResult, DeleteBatch, ItemKey};
use crate::store::PartitionStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    /// Request conduit open, batches are being executed
    Draining,
    /// A batch failed or the pipeline was aborted; terminal
    Failed,
    /// Request conduit closed with no pending error; terminal
    Completed,
}

/// Why the executor stopped calling the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// The `batch`-th call failed.
    BatchFailed { batch: u64, source: StoreError },
    /// The abort token fired before the next call.
    Aborted,
}

#[derive(Debug)]
pub struct ExecutorOutcome {
    pub state: ExecutorState,
    /// Batches executed successfully
    pub executed: u64,
    pub halt: Option<Halt>,
    /// The failed batch, if any, followed by every batch drained after it
    pub unexecuted: Vec<DeleteBatch>,
    /// Keys returned unprocessed by successful calls, in call order
    pub unprocessed: Vec<ItemKey>,
}

pub struct BatchExecutor {
    store: Arc<dyn PartitionStore>,
    metrics: Arc<Metrics>,
    abort: CancellationToken,
    state: ExecutorState,
}

impl BatchExecutor {
    /// `abort` is checked before every call and cancelled on failure, so
    /// the orchestrator stops fetching pages.
    pub fn new(
        store: Arc<dyn PartitionStore>,
        metrics: Arc<Metrics>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            store,
            metrics,
            abort,
            state: ExecutorState::Idle,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Run as a standing worker on its own task.
    pub fn spawn(
        self,
        requests: mpsc::Receiver<DeleteBatch>,
        results: mpsc::Sender<BatchResult>,
    ) -> JoinHandle<ExecutorOutcome> {
        tokio::spawn(
            self.run(requests, results)
                .instrument(tracing::info_span!("executor")),
        )
    }

    /// Drain `requests` until the conduit closes. `results` is dropped on
    /// return, which closes the result conduit.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<DeleteBatch>,
        results: mpsc::Sender<BatchResult>,
    ) -> ExecutorOutcome {
        self.transition(ExecutorState::Draining);

        let mut executed = 0u64;
        let mut calls = 0u64;
        let mut halt = None;
        let mut unexecuted = Vec::new();
        let mut unprocessed = Vec::new();

        while let Some(batch) = requests.recv().await {
            if halt.is_some() {
                unexecuted.push(batch);
                continue;
            }
            if self.abort.is_cancelled() {
                tracing::warn!("Pipeline aborted, remaining batches will not be executed");
                halt = Some(Halt::Aborted);
                self.transition(ExecutorState::Failed);
                unexecuted.push(batch);
                continue;
            }

            calls += 1;
            match self.store.batch_delete(&batch).await {
                Ok(result) => {
                    executed += 1;
                    tracing::info!(
                        batch = calls,
                        size = batch.len(),
                        deleted = result.deleted_items(),
                        consumed_capacity_units = result.consumed_capacity_units,
                        "Batch deleted"
                    );
                    if !result.unprocessed.is_empty() {
                        tracing::warn!(
                            batch = calls,
                            unprocessed = result.unprocessed.len(),
                            "Store returned unprocessed items"
                        );
                        unprocessed.extend(result.unprocessed.iter().cloned());
                    }
                    self.metrics.add_batch_executed(
                        result.deleted_items(),
                        result.unprocessed_items(),
                        result.consumed_capacity_units,
                    );
                    if results.send(result).await.is_err() {
                        tracing::warn!("Result conduit closed, summary will be incomplete");
                    }
                }
                Err(source) => {
                    tracing::error!(batch = calls, size = batch.len(), error = %source, "Batch delete failed");
                    self.metrics.add_failure();
                    self.abort.cancel();
                    halt = Some(Halt::BatchFailed {
                        batch: calls,
                        source,
                    });
                    self.transition(ExecutorState::Failed);
                    unexecuted.push(batch);
                }
            }
        }

        if halt.is_none() {
            self.transition(ExecutorState::Completed);
        }
        if !unexecuted.is_empty() {
            tracing::warn!(batches = unexecuted.len(), "Batches left unexecuted");
            self.metrics.add_batches_unexecuted(unexecuted.len() as u64);
        }

        ExecutorOutcome {
            state: self.state,
            executed,
            halt,
            unexecuted,
            unprocessed,
        }
    }

    fn transition(&mut self, next: ExecutorState) {
        tracing::debug!(from = ?self.state, to = ?next, "Executor state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeMap, ItemKey, KeySchemaElement, KeyValue, TableKeySchema};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn orders_store() -> MemoryStore {
        MemoryStore::new()
            .with_table("Orders", vec![KeySchemaElement::partition("CustomerId")])
            .with_items(
                "Orders",
                (0..10).map(|i| {
                    AttributeMap::from([("CustomerId".to_string(), KeyValue::S(format!("C-{i}")))])
                }),
            )
    }

    fn batch(first: usize, count: usize) -> DeleteBatch {
        let schema = TableKeySchema {
            table_name: "Orders".to_string(),
            partition_key: "CustomerId".to_string(),
            range_key: None,
        };
        let keys = (first..first + count)
            .map(|i| {
                ItemKey::from_attributes(
                    &schema,
                    [("CustomerId".to_string(), KeyValue::S(format!("C-{i}")))].into(),
                )
                .unwrap()
            })
            .collect();
        DeleteBatch::new("Orders", keys).unwrap()
    }

    async fn run_executor(
        store: Arc<MemoryStore>,
        batches: Vec<DeleteBatch>,
        abort: CancellationToken,
    ) -> (ExecutorOutcome, Vec<BatchResult>) {
        let (request_tx, request_rx) = mpsc::channel(2);
        let (result_tx, mut result_rx) = mpsc::channel(2);
        let executor = BatchExecutor::new(store, Metrics::new(), abort).spawn(request_rx, result_tx);

        let collector = tokio::spawn(async move {
            let mut results = Vec::new();
            while let Some(result) = result_rx.recv().await {
                results.push(result);
            }
            results
        });
        for batch in batches {
            request_tx.send(batch).await.unwrap();
        }
        drop(request_tx);

        (executor.await.unwrap(), collector.await.unwrap())
    }

    #[tokio::test]
    async fn test_executes_all_batches() {
        let store = Arc::new(orders_store().with_latency(Duration::from_millis(2)));
        let (outcome, results) = run_executor(
            store.clone(),
            vec![batch(0, 4), batch(4, 3), batch(7, 3)],
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, ExecutorState::Completed);
        assert_eq!(outcome.executed, 3);
        assert!(outcome.halt.is_none());
        assert!(outcome.unexecuted.is_empty());
        assert_eq!(results.len(), 3);
        assert_eq!(store.item_count("Orders"), 0);
        assert_eq!(store.max_concurrent_batches(), 1);
    }

    #[tokio::test]
    async fn test_failure_drains_remaining() {
        let store = Arc::new(orders_store().fail_batch_call(2, StoreError::Throttled("busy".into())));
        let abort = CancellationToken::new();
        let (outcome, results) = run_executor(
            store.clone(),
            vec![batch(0, 4), batch(4, 3), batch(7, 3)],
            abort.clone(),
        )
        .await;

        assert_eq!(outcome.state, ExecutorState::Failed);
        assert_eq!(outcome.executed, 1);
        assert!(matches!(outcome.halt, Some(Halt::BatchFailed { batch: 2, .. })));
        assert_eq!(outcome.unexecuted, vec![batch(4, 3), batch(7, 3)]);
        assert_eq!(results.len(), 1);
        assert_eq!(store.batch_calls(), 2);
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_aborted_before_first_call() {
        let store = Arc::new(orders_store());
        let abort = CancellationToken::new();
        abort.cancel();

        let (outcome, results) = run_executor(store.clone(), vec![batch(0, 2)], abort).await;

        assert_eq!(outcome.halt, Some(Halt::Aborted));
        assert_eq!(outcome.unexecuted.len(), 1);
        assert!(results.is_empty());
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn test_collects_unprocessed_keys() {
        let store = Arc::new(orders_store().with_unprocessed(2, 1));
        let (outcome, results) = run_executor(
            store.clone(),
            vec![batch(0, 4), batch(4, 3)],
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome.state, ExecutorState::Completed);
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.unprocessed, batch(6, 1).into_keys());
        assert_eq!(results[1].unprocessed_items(), 1);
        assert_eq!(store.item_count("Orders"), 4);
    }

    #[test]
    fn test_starts_idle() {
        let executor = BatchExecutor::new(
            Arc::new(MemoryStore::new()),
            Metrics::new(),
            CancellationToken::new(),
        );
        assert_eq!(executor.state(), ExecutorState::Idle);
    }
}
