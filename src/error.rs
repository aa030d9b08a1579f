//! Error types for partition deletion.
//!
//! [`StoreError`] classifies failures of the three remote primitives.
//! [`DeleteError`] is what a deletion request surfaces to its caller; every
//! variant is terminal for that request. Nothing here is retried.
//!
//! Failures after deletion has started carry a [`PartialProgress`]: the
//! summary accumulated before the failure, every batch that was queued but
//! never executed and every key the store handed back unprocessed, so the
//! caller can tell which keys survived.

use crate::model::{DeleteBatch, DeletionSummary, ItemKey};

/// Failure of a remote store primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("request rejected: {0}")]
    Validation(String),

    #[error("malformed store response: {0}")]
    MalformedResponse(String),
}

/// Work completed and work dropped before a request failed.
#[derive(Debug, Clone, Default)]
pub struct PartialProgress {
    pub summary: DeletionSummary,
    pub unexecuted: Vec<DeleteBatch>,
    /// Keys sent in a successful batch call but returned unprocessed.
    pub unprocessed: Vec<ItemKey>,
}

impl PartialProgress {
    /// Keys that were queued for deletion but never sent to the store.
    pub fn unexecuted_keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.unexecuted.iter().flat_map(|batch| batch.keys())
    }

    pub fn unexecuted_key_count(&self) -> usize {
        self.unexecuted.iter().map(DeleteBatch::len).sum()
    }

    /// Every key still in the table: unexecuted first, then unprocessed.
    pub fn remaining_keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.unexecuted_keys().chain(self.unprocessed.iter())
    }

    pub fn remaining_key_count(&self) -> usize {
        self.unexecuted_key_count() + self.unprocessed.len()
    }
}

/// Terminal failure of a deletion request.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("table `{table}` does not exist")]
    TableNotFound { table: String },

    #[error("failed to resolve key schema of table `{table}`: {source}")]
    SchemaLookupFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("query page {page} failed: {source}")]
    QueryPageFailed {
        page: usize,
        #[source]
        source: StoreError,
        progress: PartialProgress,
    },

    #[error(
        "batch delete {batch} failed: {source} ({} queued keys not deleted)",
        .progress.unexecuted_key_count()
    )]
    BatchDeleteFailed {
        batch: u64,
        #[source]
        source: StoreError,
        progress: PartialProgress,
    },

    #[error("request cancelled")]
    Cancelled { progress: PartialProgress },

    #[error(
        "partition only partly deleted: store returned {} keys unprocessed",
        .progress.unprocessed.len()
    )]
    Incomplete { progress: PartialProgress },

    #[error("{stage} worker panicked")]
    WorkerPanicked {
        stage: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl DeleteError {
    /// True when the request failed before any query was issued because the
    /// table's key schema could not be resolved.
    pub fn is_schema_lookup_failure(&self) -> bool {
        matches!(
            self,
            DeleteError::TableNotFound { .. } | DeleteError::SchemaLookupFailed { .. }
        )
    }

    /// Partial progress, when the failure happened mid-pipeline.
    pub fn progress(&self) -> Option<&PartialProgress> {
        match self {
            DeleteError::QueryPageFailed { progress, .. }
            | DeleteError::BatchDeleteFailed { progress, .. }
            | DeleteError::Cancelled { progress }
            | DeleteError::Incomplete { progress } => Some(progress),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KeyValue, TableKeySchema};

    #[test]
    fn test_schema_lookup_classification() {
        let not_found = DeleteError::TableNotFound {
            table: "Orders".into(),
        };
        let failed = DeleteError::SchemaLookupFailed {
            table: "Orders".into(),
            source: StoreError::Unavailable("connection refused".into()),
        };
        let cancelled = DeleteError::Cancelled {
            progress: PartialProgress::default(),
        };

        assert!(not_found.is_schema_lookup_failure());
        assert!(failed.is_schema_lookup_failure());
        assert!(!cancelled.is_schema_lookup_failure());
        assert!(not_found.progress().is_none());
        assert!(cancelled.progress().is_some());
    }

    #[test]
    fn test_unexecuted_keys() {
        let schema = TableKeySchema {
            table_name: "Orders".into(),
            partition_key: "CustomerId".into(),
            range_key: None,
        };
        let key = ItemKey::from_attributes(
            &schema,
            [("CustomerId".to_string(), KeyValue::S("C-1".into()))].into(),
        )
        .unwrap();
        let progress = PartialProgress {
            summary: DeletionSummary::default(),
            unexecuted: vec![
                DeleteBatch::new("Orders", vec![key.clone(); 25]).unwrap(),
                DeleteBatch::new("Orders", vec![key.clone(); 5]).unwrap(),
            ],
            unprocessed: vec![key; 2],
        };

        assert_eq!(progress.unexecuted_key_count(), 30);
        assert_eq!(progress.unexecuted_keys().count(), 30);
        assert_eq!(progress.remaining_key_count(), 32);
        assert_eq!(progress.remaining_keys().count(), 32);

        let err = DeleteError::BatchDeleteFailed {
            batch: 2,
            source: StoreError::Throttled("slow down".into()),
            progress,
        };
        assert!(err.to_string().contains("30 queued keys"));
    }

    #[test]
    fn test_incomplete_carries_progress() {
        let err = DeleteError::Incomplete {
            progress: PartialProgress::default(),
        };
        assert!(err.progress().is_some());
        assert!(!err.is_schema_lookup_failure());
        assert!(err.to_string().contains("0 keys unprocessed"));
    }
}
