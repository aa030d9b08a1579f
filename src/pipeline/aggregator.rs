//! Summary aggregation.

use crate::model::{BatchResult, DeletionSummary};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Sole consumer of the result conduit. Reports its summary once, after the
/// conduit closes.
#[derive(Debug, Default)]
pub struct SummaryAggregator {
    summary: DeletionSummary,
}

impl SummaryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, result: &BatchResult) {
        self.summary.absorb(result);
    }

    pub fn spawn(self, results: mpsc::Receiver<BatchResult>) -> JoinHandle<DeletionSummary> {
        tokio::spawn(self.run(results).instrument(tracing::info_span!("aggregator")))
    }

    pub async fn run(mut self, mut results: mpsc::Receiver<BatchResult>) -> DeletionSummary {
        while let Some(result) = results.recv().await {
            self.absorb(&result);
        }

        tracing::info!(
            total_deleted_items = self.summary.total_items_deleted,
            total_consumed_capacity_units = self.summary.total_consumed_capacity_units,
            total_unprocessed_items = self.summary.total_unprocessed_items,
            batches_executed = self.summary.batches_executed,
            "Delete partition summary report"
        );
        self.summary
    }
}
