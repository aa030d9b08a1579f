//! ddbctl
//!
//! Bulk-deletes every item of one DynamoDB partition without the caller
//! enumerating items or managing batches.
//!
//! # Architecture
//!
//! A deletion request runs through:
//!
//! - **Schema**: resolve the table's partition key and optional sort key
//! - **Query**: page through the partition, projecting key attributes only
//! - **Splitter**: cut each page into batches of at most 25 keys
//! - **Executor**: one standing worker issuing batch deletes one at a time
//! - **Aggregator**: total deleted items and consumed capacity
//!
//! Stages talk through bounded conduits and shut down strictly downstream.
//!
//! # Usage
//!
//! ```no_run
//! use ddbctl::{run_deletion, Config, DeletionRequest, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("ddbctl.yaml".as_ref())?;
//!     let request = DeletionRequest::new("Orders", "C-100");
//!     let summary = run_deletion(&config, &request, &RequestContext::new()).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod store;

pub use config::{Config, LogFormat};
pub use error::{DeleteError, PartialProgress, StoreError};
pub use model::{DeletionRequest, DeletionSummary, RequestContext};
pub use pipeline::{Metrics, PartitionAnalysis, Pipeline, PipelineConfig};
pub use store::{DynamoDbStore, MemoryStore, PartitionStore};

use anyhow::Result;
use std::sync::Arc;

/// Delete one partition against the store described by `config`.
pub async fn run_deletion(
    config: &Config,
    request: &DeletionRequest,
    ctx: &RequestContext,
) -> Result<DeletionSummary> {
    config.validate()?;

    let store = Arc::new(DynamoDbStore::from_config(&config.aws).await);
    delete_with_store(config, store, request, ctx).await
}

async fn delete_with_store(
    config: &Config,
    store: Arc<dyn PartitionStore>,
    request: &DeletionRequest,
    ctx: &RequestContext,
) -> Result<DeletionSummary> {
    let pipeline = Pipeline::new(store, Metrics::new(), PipelineConfig::from(&config.pipeline));
    let result = pipeline.run(request, ctx).await;
    if let Err(err) = &result {
        report_partial_progress(err, ctx);
    }

    let snapshot = pipeline.metrics().snapshot();
    tracing::info!(request_id = %ctx.request_id, "Final: {}", snapshot);
    if let Some(path) = &config.metrics_output_path {
        if let Err(err) = snapshot.save_to_file(path) {
            tracing::warn!(request_id = %ctx.request_id, path = %path, error = %err, "Failed to save metrics");
        }
    }

    Ok(result?)
}

/// Walk one partition and report what a deletion would do.
pub async fn run_analysis(
    config: &Config,
    request: &DeletionRequest,
    ctx: &RequestContext,
) -> Result<PartitionAnalysis> {
    config.validate()?;

    let store = Arc::new(DynamoDbStore::from_config(&config.aws).await);
    let pipeline = Pipeline::new(store, Metrics::new(), PipelineConfig::from(&config.pipeline));
    Ok(pipeline.analyze(request, ctx).await?)
}

/// Log what a failed request left behind: items deleted before the failure
/// and every key still in the table.
pub fn report_partial_progress(err: &DeleteError, ctx: &RequestContext) {
    let Some(progress) = err.progress() else {
        return;
    };

    tracing::error!(
        request_id = %ctx.request_id,
        error = %err,
        deleted = progress.summary.total_items_deleted,
        not_deleted = progress.remaining_key_count(),
        "Partition deletion incomplete"
    );
    for key in progress.remaining_keys() {
        tracing::debug!(request_id = %ctx.request_id, %key, "Key not deleted");
    }
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
