use aws_config::SdkConfig;
use service::{BedrockInferenceClient, S3ObjectFetcher};
use state_dynamodb::{DynamoDbStepLog, DynamoDbTrackingStore};
use std::sync::Arc;
use workflow::{PipelineConfig, Services, WorkflowExecutor};

/// Executor backed by DynamoDB, S3 and Bedrock.
pub(crate) fn executor(sdk_config: &SdkConfig, config: &PipelineConfig) -> WorkflowExecutor {
    let dynamodb_client: aws_sdk_dynamodb::Client = aws_sdk_dynamodb::Client::new(sdk_config);
    let s3_client: aws_sdk_s3::Client = aws_sdk_s3::Client::new(sdk_config);

    let services: Services = Services {
        tracking: Arc::new(DynamoDbTrackingStore::new(
            dynamodb_client.clone(),
            &config.resources.tracking_table,
        )),
        fetcher: Arc::new(S3ObjectFetcher::new(
            s3_client.clone(),
            &config.resources.upload_bucket,
        )),
        inference: Arc::new(BedrockInferenceClient::new(
            aws_sdk_bedrockruntime::Client::new(sdk_config),
            &config.inference.model_id,
        )),
    };

    WorkflowExecutor::new(
        Arc::new(
            DynamoDbStepLog::new(dynamodb_client, &config.resources.step_log_table)
                .with_payload_bucket(s3_client, &config.resources.step_payload_bucket),
        ),
        services,
        config.retry.clone(),
        config.inference.clone(),
    )
}
