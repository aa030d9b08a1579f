//! DynamoDB implementation of [`PartitionStore`].
//!
//! Client configuration follows the usual AWS resolution order (environment,
//! shared config files, instance profile) unless static credentials are
//! configured, which is what DynamoDB Local expects.

use super::PartitionStore;
use crate::config::AwsConfig;
use crate::error::StoreError;
use crate::model::{
    AttributeMap, BatchResult, DeleteBatch, ItemKey, KeySchemaElement, KeyValue, PageCursor,
    PartitionQuery, QueryPage,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, KeyType, ReturnConsumedCapacity, ReturnItemCollectionMetrics,
    WriteRequest,
};
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;

const PARTITION_KEY_PLACEHOLDER: &str = "#pk";
const SORT_KEY_PLACEHOLDER: &str = "#sk";
const PARTITION_VALUE_PLACEHOLDER: &str = ":pk";

/// Build a DynamoDB client from the `aws` configuration section.
pub async fn connect(config: &AwsConfig) -> Client {
    tracing::info!(
        region = %config.region,
        endpoint_url = config.endpoint_url.as_deref().unwrap_or("<default>"),
        "Creating DynamoDB client"
    );

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    if let Some(static_credentials) = &config.static_credentials {
        loader = loader.credentials_provider(Credentials::new(
            static_credentials.access_key_id.clone(),
            static_credentials.secret_access_key.clone(),
            None,
            None,
            "ddbctl-static",
        ));
    }

    Client::new(&loader.load().await)
}

/// [`PartitionStore`] backed by an `aws-sdk-dynamodb` client.
#[derive(Debug, Clone)]
pub struct DynamoDbStore {
    client: Client,
}

impl DynamoDbStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_config(config: &AwsConfig) -> Self {
        Self::new(connect(config).await)
    }
}

#[async_trait]
impl PartitionStore for DynamoDbStore {
    async fn describe_key_schema(
        &self,
        table_name: &str,
    ) -> Result<Vec<KeySchemaElement>, StoreError> {
        let output = self
            .client
            .describe_table()
            .table_name(table_name)
            .send()
            .await
            .map_err(|err| classify_sdk_error(&err))?;

        let table = output.table.ok_or_else(|| {
            StoreError::MalformedResponse(format!("no description returned for `{table_name}`"))
        })?;

        Ok(table
            .key_schema
            .unwrap_or_default()
            .into_iter()
            .filter_map(|element| match element.key_type {
                KeyType::Hash => Some(KeySchemaElement::partition(element.attribute_name)),
                KeyType::Range => Some(KeySchemaElement::sort(element.attribute_name)),
                _ => None,
            })
            .collect())
    }

    async fn query_page(
        &self,
        query: &PartitionQuery,
        cursor: Option<&PageCursor>,
    ) -> Result<QueryPage, StoreError> {
        let mut names = HashMap::from([(
            PARTITION_KEY_PLACEHOLDER.to_string(),
            query.partition_key.clone(),
        )]);
        let mut projection = vec![PARTITION_KEY_PLACEHOLDER];
        if let Some(sort_key) = query.projection.get(1) {
            names.insert(SORT_KEY_PLACEHOLDER.to_string(), sort_key.clone());
            projection.push(SORT_KEY_PLACEHOLDER);
        }

        let output = self
            .client
            .query()
            .table_name(&query.table_name)
            .key_condition_expression(format!(
                "{PARTITION_KEY_PLACEHOLDER} = {PARTITION_VALUE_PLACEHOLDER}"
            ))
            .set_expression_attribute_names(Some(names))
            .expression_attribute_values(
                PARTITION_VALUE_PLACEHOLDER,
                AttributeValue::S(query.partition_value.clone()),
            )
            .projection_expression(projection.join(", "))
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .set_exclusive_start_key(cursor.map(to_wire_map))
            .set_limit(query.page_size.map(query_limit))
            .send()
            .await
            .map_err(|err| classify_sdk_error(&err))?;

        let items = output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(from_wire_map)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = output
            .last_evaluated_key
            .filter(|key| !key.is_empty())
            .map(from_wire_map)
            .transpose()?
            .map(PageCursor::from);

        Ok(QueryPage {
            items,
            consumed_capacity_units: output
                .consumed_capacity
                .and_then(|capacity| capacity.capacity_units)
                .unwrap_or(0.0),
            next_cursor,
        })
    }

    async fn batch_delete(&self, batch: &DeleteBatch) -> Result<BatchResult, StoreError> {
        let requests = batch
            .keys()
            .iter()
            .map(|key| {
                let key = key
                    .attributes()
                    .map(|(name, value)| (name.to_string(), to_attribute_value(value)))
                    .collect();
                DeleteRequest::builder()
                    .set_key(Some(key))
                    .build()
                    .map(|request| WriteRequest::builder().delete_request(request).build())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::Validation(err.to_string()))?;

        let output = self
            .client
            .batch_write_item()
            .request_items(batch.table_name(), requests)
            .return_consumed_capacity(ReturnConsumedCapacity::Total)
            .return_item_collection_metrics(ReturnItemCollectionMetrics::Size)
            .send()
            .await
            .map_err(|err| classify_sdk_error(&err))?;

        let consumed_capacity_units = output
            .consumed_capacity
            .unwrap_or_default()
            .iter()
            .filter_map(|capacity| capacity.capacity_units)
            .sum();

        let returned = output
            .unprocessed_items
            .and_then(|mut tables| tables.remove(batch.table_name()))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|request| request.delete_request)
            .map(|delete| from_wire_map(delete.key))
            .collect::<Result<Vec<_>, _>>()?;
        let unprocessed = match_unprocessed(batch, &returned);

        Ok(BatchResult {
            item_collection_metrics: HashMap::from([(
                batch.table_name().to_string(),
                batch.len().saturating_sub(unprocessed.len()) as u64,
            )]),
            consumed_capacity_units,
            unprocessed,
        })
    }
}

/// Query `Limit` for a page size; the wire type is a signed 32-bit int.
fn query_limit(page_size: u32) -> i32 {
    i32::try_from(page_size).unwrap_or(i32::MAX)
}

/// Keys of `batch` the store returned among its unprocessed requests.
fn match_unprocessed(batch: &DeleteBatch, returned: &[AttributeMap]) -> Vec<ItemKey> {
    if returned.is_empty() {
        return Vec::new();
    }
    batch
        .keys()
        .iter()
        .filter(|key| returned.contains(&key.to_attribute_map()))
        .cloned()
        .collect()
}

/// Map an SDK error onto the store's failure classes by its error code.
fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = DisplayErrorContext(err).to_string();
    let code = err.as_service_error().and_then(|service| service.code());
    classify_error_code(code, detail)
}

fn classify_error_code(code: Option<&str>, detail: String) -> StoreError {
    match code {
        Some("ResourceNotFoundException") => StoreError::NotFound(detail),
        Some(
            "ProvisionedThroughputExceededException"
            | "RequestLimitExceeded"
            | "ThrottlingException",
        ) => StoreError::Throttled(detail),
        Some("ValidationException") => StoreError::Validation(detail),
        _ => StoreError::Unavailable(detail),
    }
}

fn to_attribute_value(value: &KeyValue) -> AttributeValue {
    match value {
        KeyValue::S(s) => AttributeValue::S(s.clone()),
        KeyValue::N(n) => AttributeValue::N(n.clone()),
        KeyValue::B(b) => AttributeValue::B(Blob::new(b.clone())),
    }
}

fn from_attribute_value(name: &str, value: AttributeValue) -> Result<KeyValue, StoreError> {
    match value {
        AttributeValue::S(s) => Ok(KeyValue::S(s)),
        AttributeValue::N(n) => Ok(KeyValue::N(n)),
        AttributeValue::B(b) => Ok(KeyValue::B(b.into_inner())),
        other => Err(StoreError::MalformedResponse(format!(
            "key attribute `{name}` is not a scalar: {other:?}"
        ))),
    }
}

fn from_wire_map(item: HashMap<String, AttributeValue>) -> Result<AttributeMap, StoreError> {
    item.into_iter()
        .map(|(name, value)| {
            let value = from_attribute_value(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

fn to_wire_map(cursor: &PageCursor) -> HashMap<String, AttributeValue> {
    cursor
        .0
        .iter()
        .map(|(name, value)| (name.clone(), to_attribute_value(value)))
        .collect()
}
