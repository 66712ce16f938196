use crate::backend_failure;
use crate::records::{INSTANCE_ID, OBJECT_KEY};
use async_trait::async_trait;
use aws_sdk_dynamodb::operation::get_item::GetItemOutput;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValuesOnConditionCheckFailure};
use chrono::Utc;
use model::{InstanceId, ObjectKey, WorkflowRecord};
use state::StateErrorReason::{BadState, StaleInstance};
use state::StateOperation::{GetRecord, SetAnalysis as SetAnalysisOp, Upsert};
use state::{SetAnalysis, StateError, TrackingStore};

/// Tracking table partitioned on `object_key`.
pub struct DynamoDbTrackingStore {
    table_name: String,
    dynamodb_client: aws_sdk_dynamodb::Client,
}

impl DynamoDbTrackingStore {
    pub fn new(dynamodb_client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        DynamoDbTrackingStore {
            table_name: table_name.into(),
            dynamodb_client,
        }
    }
}

#[async_trait]
impl TrackingStore for DynamoDbTrackingStore {
    async fn upsert(
        &self,
        object_key: &ObjectKey,
        instance_id: &InstanceId,
    ) -> Result<(), StateError> {
        self.dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(OBJECT_KEY, AttributeValue::S(object_key.to_string()))
            .update_expression(
                "SET instance_id = :instance_id, updated_at = :updated_at REMOVE analysis_result",
            )
            .expression_attribute_values(":instance_id", AttributeValue::S(instance_id.to_string()))
            .expression_attribute_values(":updated_at", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await
            .map_err(|err| backend_failure(object_key.as_str(), Upsert, err))?;

        Ok(())
    }

    async fn set_analysis(
        &self,
        object_key: &ObjectKey,
        instance_id: &InstanceId,
        analysis: &str,
    ) -> Result<SetAnalysis, StateError> {
        let result = self
            .dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key(OBJECT_KEY, AttributeValue::S(object_key.to_string()))
            .update_expression("SET analysis_result = :analysis, updated_at = :updated_at")
            .condition_expression("attribute_exists(object_key) AND instance_id = :instance_id")
            .expression_attribute_values(":analysis", AttributeValue::S(analysis.to_string()))
            .expression_attribute_values(":updated_at", AttributeValue::S(Utc::now().to_rfc3339()))
            .expression_attribute_values(":instance_id", AttributeValue::S(instance_id.to_string()))
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        let err = match result {
            Ok(_) => return Ok(SetAnalysis::Applied),
            Err(err) => err,
        };

        let Some(UpdateItemError::ConditionalCheckFailedException(check)) = err.as_service_error()
        else {
            return Err(backend_failure(object_key.as_str(), SetAnalysisOp, err));
        };

        // The old item comes back only if the record exists
        let Some(item) = check.item() else {
            return Ok(SetAnalysis::MissingRecord);
        };

        let current: InstanceId = item
            .get(INSTANCE_ID)
            .and_then(|value| value.as_s().ok())
            .map(|value| InstanceId::from(value.as_str()))
            .ok_or_else(|| {
                StateError::new(
                    object_key.as_str(),
                    SetAnalysisOp,
                    BadState("record has no instance_id".to_string()),
                )
            })?;

        Err(StateError::new(
            object_key.as_str(),
            SetAnalysisOp,
            StaleInstance { current },
        ))
    }

    async fn get(&self, object_key: &ObjectKey) -> Result<Option<WorkflowRecord>, StateError> {
        let output: GetItemOutput = self
            .dynamodb_client
            .get_item()
            .table_name(&self.table_name)
            .key(OBJECT_KEY, AttributeValue::S(object_key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| backend_failure(object_key.as_str(), GetRecord, err))?;

        let Some(item) = output.item else {
            return Ok(None);
        };

        let record: WorkflowRecord = serde_dynamo::from_item(item).map_err(|err| {
            StateError::new(object_key.as_str(), GetRecord, BadState(err.to_string()))
        })?;

        Ok(Some(record))
    }
}
