use aws_config::{BehaviorVersion, SdkConfig};
use aws_lambda_events::sqs::SqsEvent;
use lambda_runtime::{LambdaEvent, service_fn, tracing};
use model::Error;
use workflow::{PipelineConfig, QueueConsumer, handle_sqs_event};

mod wiring;

/// Lambda function fed by the upload events queue.
///
/// The event source mapping *must* have `ReportBatchItemFailures` enabled.
#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let config: PipelineConfig = PipelineConfig::from_env()?;
    let sdk_config: SdkConfig = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let consumer: QueueConsumer = QueueConsumer::new(wiring::executor(&sdk_config, &config));

    lambda_runtime::run(service_fn(async |event: LambdaEvent<SqsEvent>| {
        handle_sqs_event(&consumer, event).await
    }))
    .await
}
