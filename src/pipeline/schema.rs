//! Key schema resolution.

use crate::error::{DeleteError, PartialProgress, StoreError};
use crate::model::{KeyRole, KeySchemaElement, TableKeySchema};
use crate::store::PartitionStore;
use tokio_util::sync::CancellationToken;

/// Resolve the partition key and optional sort key of `table_name`.
///
/// A missing table surfaces as [`DeleteError::TableNotFound`]; any other
/// describe failure as [`DeleteError::SchemaLookupFailed`]. Both are fatal.
pub async fn resolve_key_schema(
    store: &dyn PartitionStore,
    table_name: &str,
    cancel: &CancellationToken,
) -> Result<TableKeySchema, DeleteError> {
    if cancel.is_cancelled() {
        return Err(DeleteError::Cancelled {
            progress: PartialProgress::default(),
        });
    }

    let elements = store
        .describe_key_schema(table_name)
        .await
        .map_err(|source| match source {
            StoreError::NotFound(_) => DeleteError::TableNotFound {
                table: table_name.to_string(),
            },
            source => DeleteError::SchemaLookupFailed {
                table: table_name.to_string(),
                source,
            },
        })?;

    let schema = schema_from_elements(table_name, &elements)?;
    tracing::info!(
        table = %schema.table_name,
        partition_key = %schema.partition_key,
        range_key = schema.range_key.as_deref().unwrap_or("<none>"),
        "Resolved table key schema"
    );
    Ok(schema)
}

/// Pick the first partition and sort key elements, stopping once both are
/// known. Later elements belong to index key schemas and are ignored.
fn schema_from_elements(
    table_name: &str,
    elements: &[KeySchemaElement],
) -> Result<TableKeySchema, DeleteError> {
    let mut partition_key = None;
    let mut range_key = None;

    for element in elements {
        match element.role {
            KeyRole::Partition if partition_key.is_none() => {
                partition_key = Some(element.attribute_name.clone());
            }
            KeyRole::Sort if range_key.is_none() => {
                range_key = Some(element.attribute_name.clone());
            }
            _ => {}
        }
        if partition_key.is_some() && range_key.is_some() {
            break;
        }
    }

    let partition_key = partition_key.ok_or_else(|| DeleteError::SchemaLookupFailed {
        table: table_name.to_string(),
        source: StoreError::MalformedResponse("key schema has no partition key".to_string()),
    })?;

    Ok(TableKeySchema {
        table_name: table_name.to_string(),
        partition_key,
        range_key,
    })
}
