use crate::records::{
    INSTANCE_ID, INVOCATION_SORT_KEY, InvocationItem, SORT_KEY, StepItem, StoredOutput,
    step_sort_key,
};
use crate::{backend_failure, write_failure};
use async_trait::async_trait;
use aws_sdk_dynamodb::operation::get_item::GetItemOutput;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use model::{InstanceId, InstanceState, InstanceStatus, Invocation, StepEntry, StepName};
use state::StateErrorReason::{BadState, MissingEntry};
use state::StateOperation::{
    GetInvocation, GetStep, ListInvocations, PutInvocation, PutStep, UpdateStatus,
};
use state::{StateError, StateOperation, StepLog};
use std::collections::HashMap;

/// Longest output text kept in the step row, well under the 400 KB item limit.
pub const INLINE_OUTPUT_LIMIT: usize = 300 * 1024;
const PAYLOAD_PREFIX: &str = "step-outputs/";

/// Step log table partitioned on `instance_id` and sorted on `sk`.
///
/// Each partition holds one invocation row (`sk = "invocation"`) and a row
/// per completed step (`sk = "step#<name>"`). Step outputs over
/// [`INLINE_OUTPUT_LIMIT`] are written to the payload bucket and the row keeps
/// their object key.
pub struct DynamoDbStepLog {
    table_name: String,
    dynamodb_client: aws_sdk_dynamodb::Client,
    payloads: Option<PayloadBucket>,
}

struct PayloadBucket {
    s3_client: aws_sdk_s3::Client,
    bucket: String,
}

impl DynamoDbStepLog {
    pub fn new(dynamodb_client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        DynamoDbStepLog {
            table_name: table_name.into(),
            dynamodb_client,
            payloads: None,
        }
    }

    /// Store oversized step outputs in `bucket`. Without one they are rejected.
    pub fn with_payload_bucket(
        mut self,
        s3_client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
    ) -> Self {
        self.payloads = Some(PayloadBucket {
            s3_client,
            bucket: bucket.into(),
        });
        self
    }
}

#[async_trait]
impl StepLog for DynamoDbStepLog {
    async fn put_invocation(&self, invocation: &Invocation) -> Result<(), StateError> {
        let item: HashMap<String, AttributeValue> =
            serde_dynamo::to_item(InvocationItem::from(invocation)).map_err(|err| {
                StateError::new(
                    invocation.instance_id.as_str(),
                    PutInvocation,
                    BadState(err.to_string()),
                )
            })?;

        self.dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|err| write_failure(invocation.instance_id.as_str(), PutInvocation, err))?;

        Ok(())
    }

    async fn get_invocation(&self, instance_id: &InstanceId) -> Result<Invocation, StateError> {
        let item: InvocationItem = self
            .get_item(instance_id, INVOCATION_SORT_KEY, GetInvocation)
            .await?
            .ok_or_else(|| StateError::new(instance_id.as_str(), GetInvocation, MissingEntry))?;

        Ok(item.into())
    }

    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: &InstanceStatus,
    ) -> Result<(), StateError> {
        let mut request = self
            .dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(INSTANCE_ID, AttributeValue::S(instance_id.to_string()))
            .key(SORT_KEY, AttributeValue::S(INVOCATION_SORT_KEY.to_string()))
            .condition_expression("attribute_exists(instance_id)")
            .expression_attribute_names("#state", "state")
            .expression_attribute_names("#error", "error")
            .expression_attribute_values(":state", AttributeValue::S(status.state.to_string()))
            .expression_attribute_values(":updated_at", AttributeValue::S(Utc::now().to_rfc3339()));

        request = match &status.error {
            Some(error) => request
                .update_expression("SET #state = :state, #error = :error, updated_at = :updated_at")
                .expression_attribute_values(":error", AttributeValue::S(error.clone())),
            None => request
                .update_expression("SET #state = :state, updated_at = :updated_at REMOVE #error"),
        };

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) => match err.as_service_error() {
                Some(UpdateItemError::ConditionalCheckFailedException(_)) => Err(StateError::new(
                    instance_id.as_str(),
                    UpdateStatus,
                    MissingEntry,
                )),
                _ => Err(write_failure(instance_id.as_str(), UpdateStatus, err)),
            },
        }
    }

    async fn unfinished_invocations(&self) -> Result<Vec<Invocation>, StateError> {
        let items: Vec<HashMap<String, AttributeValue>> = self
            .dynamodb_client
            .scan()
            .table_name(&self.table_name)
            .filter_expression("sk = :invocation AND NOT (#state IN (:completed, :failed))")
            .expression_attribute_names("#state", "state")
            .expression_attribute_values(
                ":invocation",
                AttributeValue::S(INVOCATION_SORT_KEY.to_string()),
            )
            .expression_attribute_values(
                ":completed",
                AttributeValue::S(InstanceState::Completed.to_string()),
            )
            .expression_attribute_values(
                ":failed",
                AttributeValue::S(InstanceState::Failed.to_string()),
            )
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(|err| backend_failure(&self.table_name, ListInvocations, err))?;

        let records: Vec<InvocationItem> = serde_dynamo::from_items(items).map_err(|err| {
            StateError::new(&self.table_name, ListInvocations, BadState(err.to_string()))
        })?;

        let mut invocations: Vec<Invocation> = records.into_iter().map(Invocation::from).collect();
        invocations.sort_by_key(|invocation| invocation.created_at);

        Ok(invocations)
    }

    async fn put_step(&self, entry: &StepEntry) -> Result<(), StateError> {
        let state_key: String = format!("{}/{}", entry.instance_id, entry.step);
        let output: String = serde_json::to_string(&entry.output)
            .map_err(|err| StateError::new(&state_key, PutStep, BadState(err.to_string())))?;

        let stored: StoredOutput = if output.len() <= INLINE_OUTPUT_LIMIT {
            StoredOutput::Inline(output)
        } else {
            StoredOutput::Offloaded(self.offload(entry, &state_key, output).await?)
        };

        let item: HashMap<String, AttributeValue> =
            serde_dynamo::to_item(StepItem::new(entry, stored))
                .map_err(|err| StateError::new(&state_key, PutStep, BadState(err.to_string())))?;

        let result = self
            .dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(sk)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            // An earlier write of this step already holds the output to replay
            Err(err) => match err.as_service_error() {
                Some(PutItemError::ConditionalCheckFailedException(_)) => Ok(()),
                _ => Err(write_failure(&state_key, PutStep, err)),
            },
        }
    }

    async fn get_step(
        &self,
        instance_id: &InstanceId,
        step: StepName,
    ) -> Result<Option<StepEntry>, StateError> {
        let Some(item) = self
            .get_item::<StepItem>(instance_id, &step_sort_key(step), GetStep)
            .await?
        else {
            return Ok(None);
        };

        let state_key: String = format!("{instance_id}/{step}");
        let output: String = match item.stored_output() {
            Some(StoredOutput::Inline(text)) => text,
            Some(StoredOutput::Offloaded(location)) => self.load(&state_key, &location).await?,
            None => {
                return Err(StateError::new(
                    &state_key,
                    GetStep,
                    BadState("step row holds no output".to_string()),
                ));
            }
        };

        let output: serde_json::Value = serde_json::from_str(&output)
            .map_err(|err| StateError::new(&state_key, GetStep, BadState(err.to_string())))?;

        Ok(Some(item.into_entry(output)))
    }
}

impl DynamoDbStepLog {
    async fn get_item<T: serde::de::DeserializeOwned>(
        &self,
        instance_id: &InstanceId,
        sort_key: &str,
        operation: StateOperation,
    ) -> Result<Option<T>, StateError> {
        let output: GetItemOutput = self
            .dynamodb_client
            .get_item()
            .table_name(&self.table_name)
            .key(INSTANCE_ID, AttributeValue::S(instance_id.to_string()))
            .key(SORT_KEY, AttributeValue::S(sort_key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| backend_failure(instance_id.as_str(), operation, err))?;

        let Some(item) = output.item else {
            return Ok(None);
        };

        serde_dynamo::from_item(item)
            .map(Some)
            .map_err(|err| StateError::new(instance_id.as_str(), operation, BadState(err.to_string())))
    }

    /// Write an oversized output to the payload bucket, returning its key.
    ///
    /// Keys are unique per write so a losing duplicate never overwrites the
    /// output the row points at.
    async fn offload(
        &self,
        entry: &StepEntry,
        state_key: &str,
        output: String,
    ) -> Result<String, StateError> {
        let Some(payloads) = &self.payloads else {
            return Err(StateError::new(
                state_key,
                PutStep,
                BadState(format!(
                    "output is {} bytes, over the {INLINE_OUTPUT_LIMIT} byte inline limit, and no payload bucket is configured",
                    output.len()
                )),
            ));
        };

        let location: String = format!(
            "{PAYLOAD_PREFIX}{state_key}-{}.json",
            entry.completed_at.timestamp_micros()
        );

        payloads
            .s3_client
            .put_object()
            .bucket(&payloads.bucket)
            .key(&location)
            .content_type("application/json")
            .body(ByteStream::from(output.into_bytes()))
            .send()
            .await
            .map_err(|err| backend_failure(state_key, PutStep, err))?;

        Ok(location)
    }

    async fn load(&self, state_key: &str, location: &str) -> Result<String, StateError> {
        let Some(payloads) = &self.payloads else {
            return Err(StateError::new(
                state_key,
                GetStep,
                BadState(format!("output is stored at {location} but no payload bucket is configured")),
            ));
        };

        let object = payloads
            .s3_client
            .get_object()
            .bucket(&payloads.bucket)
            .key(location)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(GetObjectError::NoSuchKey(_)) => StateError::new(
                    state_key,
                    GetStep,
                    BadState(format!("output at {location} is gone")),
                ),
                _ => backend_failure(state_key, GetStep, err),
            })?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|err| backend_failure(state_key, GetStep, err))?;

        String::from_utf8(bytes.into_bytes().to_vec())
            .map_err(|err| StateError::new(state_key, GetStep, BadState(err.to_string())))
    }
}
