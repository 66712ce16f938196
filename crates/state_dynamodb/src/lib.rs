mod records;
mod step_log;
mod tracking;

pub use step_log::DynamoDbStepLog;
pub use tracking::DynamoDbTrackingStore;

use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use state::StateErrorReason::BadState;
use state::{StateError, StateOperation};
use std::error::Error;

/// Wrap an SDK failure, keeping the full error chain in the message.
pub(crate) fn backend_failure<E: Error>(
    state_key: &str,
    operation: StateOperation,
    err: E,
) -> StateError {
    StateError::backend(
        state_key,
        operation,
        DisplayErrorContext(err).to_string(),
    )
}

/// Like [`backend_failure`], but a request DynamoDB refused as invalid (an
/// oversized item, a malformed expression) is bad state and never retried.
pub(crate) fn write_failure<E>(
    state_key: &str,
    operation: StateOperation,
    err: SdkError<E, HttpResponse>,
) -> StateError
where
    E: ProvideErrorMetadata + Error + 'static,
{
    let invalid: bool = err
        .as_service_error()
        .and_then(|service_err| service_err.code())
        == Some("ValidationException");

    if invalid {
        StateError::new(
            state_key,
            operation,
            BadState(DisplayErrorContext(&err).to_string()),
        )
    } else {
        backend_failure(state_key, operation, err)
    }
}
