use aws_config::{BehaviorVersion, SdkConfig};
use lambda_runtime::tracing;
use model::{Error, InstanceId};
use queue_sqs::SqsQueueSource;
use workflow::{PipelineConfig, PollerConfig, QueueConsumer, WorkflowExecutor};

mod wiring;

/// Long-running consumer of the upload events queue.
///
/// Unfinished instances left by a previous process are resumed before polling starts.
#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let config: PipelineConfig = PipelineConfig::from_env()?;
    let poller: PollerConfig = PollerConfig::from_env()?;
    let sdk_config: SdkConfig = aws_config::load_defaults(BehaviorVersion::latest()).await;

    let executor: WorkflowExecutor = wiring::executor(&sdk_config, &config);
    let source: SqsQueueSource =
        SqsQueueSource::new(aws_sdk_sqs::Client::new(&sdk_config), poller.queue_url)
            .with_batch_size(poller.batch_size)
            .with_wait_seconds(poller.wait_seconds)
            .with_nack_visibility_seconds(poller.nack_visibility_seconds);

    let resumed: Vec<InstanceId> = executor.recover().await?;
    if !resumed.is_empty() {
        tracing::info!("Resumed [{}] workflows from a previous run", resumed.len());
    }

    QueueConsumer::new(executor.clone())
        .run(&source, shutdown_signal())
        .await;

    // In-flight instances are resumed by the next process
    executor.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
        Err(err) => {
            tracing::error!("Cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await
        }
    }
}
