//! Partition deletion pipeline.
//!
//! Stages are connected by two bounded conduits:
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────┐     ┌────────────┐
//! │ Page Stream │────▶│ Page Split   │────▶│ Executor │────▶│ Aggregator │
//! │ (sequential)│     │ (task/page)  │     │ (single) │     │  (single)  │
//! └─────────────┘     └──────────────┘     └──────────┘     └────────────┘
//!                                    requests          results
//! ```
//!
//! Shutdown runs strictly downstream: wait for every split task, close the
//! request conduit, wait for the executor (its exit closes the result
//! conduit), then wait for the aggregator.

use super::aggregator::SummaryAggregator;
use super::executor::{BatchExecutor, Halt};
use super::query::{PageFetchError, PageStream};
use super::schema::resolve_key_schema;
use super::splitter::{dispatch_page, split_page};
use super::Metrics;
use crate::config::PipelineSettings;
use crate::error::{DeleteError, PartialProgress};
use crate::model::{
    BatchResult, DeleteBatch, DeletionRequest, DeletionSummary, RequestContext, TableKeySchema,
};
use crate::store::PartitionStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Configuration for the deletion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the batch-request conduit
    pub request_buffer: usize,
    /// Capacity of the batch-result conduit
    pub result_buffer: usize,
    /// Items per query page; `None` lets the store decide
    pub page_size: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_buffer: 2,
            result_buffer: 2,
            page_size: None,
        }
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            request_buffer: settings.request_buffer,
            result_buffer: settings.result_buffer,
            page_size: settings.page_size,
        }
    }
}

/// Partition deletion pipeline.
pub struct Pipeline {
    store: Arc<dyn PartitionStore>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: Arc<dyn PartitionStore>, metrics: Arc<Metrics>, config: PipelineConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Delete every item of the requested partition.
    pub async fn run(
        &self,
        request: &DeletionRequest,
        ctx: &RequestContext,
    ) -> Result<DeletionSummary, DeleteError> {
        self.delete_partition(request, ctx)
            .instrument(ctx.span())
            .await
    }

    async fn delete_partition(
        &self,
        request: &DeletionRequest,
        ctx: &RequestContext,
    ) -> Result<DeletionSummary, DeleteError> {
        request.validate().map_err(DeleteError::InvalidRequest)?;
        tracing::info!(
            table = %request.table_name,
            partition_value = %request.partition_value,
            "Starting partition deletion"
        );

        // Step 1: schema, query, standing workers
        let schema = resolve_key_schema(self.store.as_ref(), &request.table_name, &ctx.cancel).await?;
        let table_name = schema.table_name.clone();
        let mut pages = PageStream::new(
            self.store.clone(),
            schema,
            &request.partition_value,
            self.config.page_size,
        );

        // Tripped by a failure anywhere, or by the caller's cancellation
        let abort = ctx.cancel.child_token();

        let (request_tx, request_rx) = mpsc::channel::<DeleteBatch>(self.config.request_buffer);
        let (result_tx, result_rx) = mpsc::channel::<BatchResult>(self.config.result_buffer);

        let executor = BatchExecutor::new(self.store.clone(), self.metrics.clone(), abort.clone())
            .spawn(request_rx, result_tx);
        let aggregator = SummaryAggregator::new().spawn(result_rx);

        // Step 2: fetch pages sequentially, one split task per page
        let mut splitters = JoinSet::new();
        let mut page_failure = None;
        let mut fetch_cancelled = false;
        loop {
            match pages.next_page(&abort).await {
                Ok(Some(page)) => {
                    self.metrics
                        .add_page(page.keys.len() as u64, page.consumed_capacity_units);
                    let span = tracing::info_span!("split", page = page.number);
                    splitters.spawn(
                        dispatch_page(
                            table_name.clone(),
                            page,
                            request_tx.clone(),
                            self.metrics.clone(),
                        )
                        .instrument(span),
                    );
                }
                Ok(None) => break,
                Err(PageFetchError::Cancelled) => {
                    fetch_cancelled = true;
                    break;
                }
                Err(PageFetchError::Failed { page, source }) => {
                    self.metrics.add_failure();
                    abort.cancel();
                    page_failure = Some((page, source));
                    break;
                }
            }
        }
        tracing::debug!(pages = pages.pages_fetched(), "Last page fetched");

        // Step 3: wait for every split task
        let mut undelivered = Vec::new();
        while let Some(joined) = splitters.join_next().await {
            match joined {
                Ok(batches) => undelivered.extend(batches),
                Err(source) => {
                    abort.cancel();
                    executor.abort();
                    aggregator.abort();
                    return Err(DeleteError::WorkerPanicked {
                        stage: "splitter",
                        source,
                    });
                }
            }
        }

        // Step 4: no more batches
        drop(request_tx);
        tracing::debug!("Request conduit closed");

        // Step 5: wait for the executor to drain
        let outcome = match executor.await {
            Ok(outcome) => outcome,
            Err(source) => {
                aggregator.abort();
                return Err(DeleteError::WorkerPanicked {
                    stage: "executor",
                    source,
                });
            }
        };
        tracing::debug!(state = ?outcome.state, executed = outcome.executed, "Executor finished");

        // Step 6: the executor owned the only result sender, so the result
        // conduit is closed now that it has returned
        tracing::debug!("Result conduit closed");

        // Step 7: wait for the summary
        let summary = aggregator.await.map_err(|source| DeleteError::WorkerPanicked {
            stage: "aggregator",
            source,
        })?;

        let mut unexecuted = outcome.unexecuted;
        unexecuted.extend(undelivered);
        let progress = PartialProgress {
            summary: summary.clone(),
            unexecuted,
            unprocessed: outcome.unprocessed,
        };

        let aborted = match outcome.halt {
            Some(Halt::BatchFailed { batch, source }) => {
                return Err(DeleteError::BatchDeleteFailed {
                    batch,
                    source,
                    progress,
                });
            }
            Some(Halt::Aborted) => true,
            None => false,
        };
        if let Some((page, source)) = page_failure {
            return Err(DeleteError::QueryPageFailed {
                page,
                source,
                progress,
            });
        }
        if fetch_cancelled || aborted {
            tracing::warn!(deleted = summary.total_items_deleted, "Partition deletion cancelled");
            return Err(DeleteError::Cancelled { progress });
        }
        if !progress.unprocessed.is_empty() {
            tracing::warn!(
                deleted = summary.total_items_deleted,
                unprocessed = progress.unprocessed.len(),
                "Partition deletion incomplete"
            );
            return Err(DeleteError::Incomplete { progress });
        }

        tracing::info!(%summary, "Partition deletion complete");
        Ok(summary)
    }

    /// Walk the partition without deleting anything.
    pub async fn analyze(
        &self,
        request: &DeletionRequest,
        ctx: &RequestContext,
    ) -> Result<PartitionAnalysis, DeleteError> {
        self.analyze_partition(request, ctx)
            .instrument(ctx.span())
            .await
    }

    async fn analyze_partition(
        &self,
        request: &DeletionRequest,
        ctx: &RequestContext,
    ) -> Result<PartitionAnalysis, DeleteError> {
        request.validate().map_err(DeleteError::InvalidRequest)?;

        let schema = resolve_key_schema(self.store.as_ref(), &request.table_name, &ctx.cancel).await?;
        let mut analysis = PartitionAnalysis {
            partition_value: request.partition_value.clone(),
            key_schema: schema.clone(),
            ..Default::default()
        };

        let mut pages = PageStream::new(
            self.store.clone(),
            schema,
            &request.partition_value,
            self.config.page_size,
        );
        loop {
            match pages.next_page(&ctx.cancel).await {
                Ok(Some(page)) => {
                    self.metrics
                        .add_page(page.keys.len() as u64, page.consumed_capacity_units);
                    analysis.pages += 1;
                    analysis.items += page.keys.len() as u64;
                    analysis.read_capacity_units += page.consumed_capacity_units;
                    analysis.batches += split_page(&analysis.key_schema.table_name, page.keys).len() as u64;
                }
                Ok(None) => break,
                Err(PageFetchError::Cancelled) => {
                    return Err(DeleteError::Cancelled {
                        progress: PartialProgress::default(),
                    })
                }
                Err(PageFetchError::Failed { page, source }) => {
                    self.metrics.add_failure();
                    return Err(DeleteError::QueryPageFailed {
                        page,
                        source,
                        progress: PartialProgress::default(),
                    });
                }
            }
        }

        tracing::info!(%analysis, "Partition analysis complete");
        Ok(analysis)
    }
}

/// What a deletion of one partition would do.
#[derive(Debug, Clone, Default)]
pub struct PartitionAnalysis {
    pub partition_value: String,
    pub key_schema: TableKeySchema,
    pub pages: u64,
    pub items: u64,
    /// Delete batches the pipeline would issue
    pub batches: u64,
    pub read_capacity_units: f64,
}

impl std::fmt::Display for PartitionAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Table: {} | Partition: {}={} | Pages: {} | Items: {} | Batches: {} | Read: {:.1} RCU",
            self.key_schema.table_name,
            self.key_schema.partition_key,
            self.partition_value,
            self.pages,
            self.items,
            self.batches,
            self.read_capacity_units
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.request_buffer, 2);
        assert_eq!(config.result_buffer, 2);
        assert!(config.page_size.is_none());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = PipelineSettings {
            request_buffer: 4,
            result_buffer: 1,
            page_size: Some(100),
        };
        let config = PipelineConfig::from(&settings);
        assert_eq!(config.request_buffer, 4);
        assert_eq!(config.result_buffer, 1);
        assert_eq!(config.page_size, Some(100));
    }

    #[test]
    fn test_analysis_display() {
        let analysis = PartitionAnalysis {
            partition_value: "C-100".to_string(),
            key_schema: TableKeySchema {
                table_name: "Orders".to_string(),
                partition_key: "CustomerId".to_string(),
                range_key: Some("OrderId".to_string()),
            },
            pages: 2,
            items: 30,
            batches: 2,
            read_capacity_units: 15.0,
        };
        let display = analysis.to_string();
        assert!(display.contains("CustomerId=C-100"));
        assert!(display.contains("Items: 30"));
        assert!(display.contains("Batches: 2"));
    }
}
