//! Partition deletion pipeline: schema resolution, paginated query, batch
//! splitting, single-worker execution and summary aggregation.

pub mod aggregator;
pub mod executor;
mod metrics;
pub mod query;
pub mod schema;
pub mod splitter;
mod stages;

#[cfg(test)]
mod integration_tests;

pub use aggregator::SummaryAggregator;
pub use executor::{BatchExecutor, ExecutorOutcome, ExecutorState};
pub use metrics::{Metrics, MetricsSnapshot};
pub use query::{Page, PageStream};
pub use schema::resolve_key_schema;
pub use splitter::split_page;
pub use stages::{PartitionAnalysis, Pipeline, PipelineConfig};
