/// S3 bucket the uploads land in
pub const UPLOAD_BUCKET_NAME: &str = "UPLOAD_BUCKET_NAME";
/// DynamoDB table holding one `WorkflowRecord` per object key
pub const TRACKING_TABLE_NAME: &str = "TRACKING_TABLE_NAME";
/// DynamoDB table holding invocations and completed steps
pub const STEP_LOG_TABLE_NAME: &str = "STEP_LOG_TABLE_NAME";
/// S3 bucket for step outputs too large for the step log table
pub const STEP_PAYLOAD_BUCKET_NAME: &str = "STEP_PAYLOAD_BUCKET_NAME";
/// Queue the poller consumes upload events from
pub const UPLOAD_EVENTS_QUEUE_URL: &str = "SQS_UPLOAD_EVENTS_QUEUE_URL";

pub const INFERENCE_MODEL_ID: &str = "INFERENCE_MODEL_ID";
pub const INFERENCE_PROMPT: &str = "INFERENCE_PROMPT";
pub const INFERENCE_MAX_TOKENS: &str = "INFERENCE_MAX_TOKENS";

pub const STEP_MAX_ATTEMPTS: &str = "STEP_MAX_ATTEMPTS";
pub const STEP_BASE_DELAY_MS: &str = "STEP_BASE_DELAY_MS";
pub const STEP_MAX_DELAY_MS: &str = "STEP_MAX_DELAY_MS";
pub const STEP_TIMEOUT_MS: &str = "STEP_TIMEOUT_MS";

pub const POLLER_BATCH_SIZE: &str = "POLLER_BATCH_SIZE";
pub const POLLER_WAIT_SECONDS: &str = "POLLER_WAIT_SECONDS";
pub const POLLER_NACK_VISIBILITY_SECONDS: &str = "POLLER_NACK_VISIBILITY_SECONDS";
