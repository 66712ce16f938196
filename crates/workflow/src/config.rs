use crate::retry::RetryPolicy;
use model::env::{
    INFERENCE_MAX_TOKENS, INFERENCE_MODEL_ID, INFERENCE_PROMPT, POLLER_BATCH_SIZE,
    POLLER_NACK_VISIBILITY_SECONDS, POLLER_WAIT_SECONDS, STEP_BASE_DELAY_MS, STEP_LOG_TABLE_NAME,
    STEP_MAX_ATTEMPTS, STEP_MAX_DELAY_MS, STEP_PAYLOAD_BUCKET_NAME, STEP_TIMEOUT_MS,
    TRACKING_TABLE_NAME, UPLOAD_BUCKET_NAME, UPLOAD_EVENTS_QUEUE_URL,
};
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-haiku-20240307-v1:0";
pub const DEFAULT_PROMPT: &str = "Provide a description of this image";
pub const DEFAULT_MAX_TOKENS: u32 = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0} environment variable")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the Lambda function and the poller share.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub resources: AwsResources,
    pub inference: InferenceSettings,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsResources {
    pub upload_bucket: String,
    pub tracking_table: String,
    pub step_log_table: String,
    // Kept apart from the upload bucket so payloads never look like uploads
    pub step_payload_bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceSettings {
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            model_id: DEFAULT_MODEL_ID.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub queue_url: String,
    pub batch_size: i32,
    pub wait_seconds: i32,
    pub nack_visibility_seconds: i32,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let resources: AwsResources = AwsResources {
            upload_bucket: required(&lookup, UPLOAD_BUCKET_NAME)?,
            tracking_table: required(&lookup, TRACKING_TABLE_NAME)?,
            step_log_table: required(&lookup, STEP_LOG_TABLE_NAME)?,
            step_payload_bucket: required(&lookup, STEP_PAYLOAD_BUCKET_NAME)?,
        };

        let defaults: InferenceSettings = InferenceSettings::default();
        let inference: InferenceSettings = InferenceSettings {
            model_id: lookup(INFERENCE_MODEL_ID).unwrap_or(defaults.model_id),
            prompt: lookup(INFERENCE_PROMPT).unwrap_or(defaults.prompt),
            max_tokens: parsed(&lookup, INFERENCE_MAX_TOKENS, defaults.max_tokens, 1..=u32::MAX)?,
        };

        let default_retry: RetryPolicy = RetryPolicy::default();
        let retry: RetryPolicy = RetryPolicy {
            max_attempts: parsed(
                &lookup,
                STEP_MAX_ATTEMPTS,
                default_retry.max_attempts,
                1..=u32::MAX,
            )?,
            base_delay: millis(&lookup, STEP_BASE_DELAY_MS, default_retry.base_delay)?,
            max_delay: millis(&lookup, STEP_MAX_DELAY_MS, default_retry.max_delay)?,
            timeout: millis(&lookup, STEP_TIMEOUT_MS, default_retry.timeout)?,
        };

        if retry.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: STEP_TIMEOUT_MS,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(PipelineConfig {
            resources,
            inference,
            retry,
        })
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(PollerConfig {
            queue_url: required(&lookup, UPLOAD_EVENTS_QUEUE_URL)?,
            // SQS limits
            batch_size: parsed(&lookup, POLLER_BATCH_SIZE, 10, 1..=10)?,
            wait_seconds: parsed(&lookup, POLLER_WAIT_SECONDS, 20, 0..=20)?,
            nack_visibility_seconds: parsed(&lookup, POLLER_NACK_VISIBILITY_SECONDS, 30, 0..=43_200)?,
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display,
    T::Err: Display,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };

    let parsed: T = value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        value: value.clone(),
        reason: err.to_string(),
    })?;

    if !range.contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            value,
            reason: format!("must be between {} and {}", range.start(), range.end()),
        });
    }

    Ok(parsed)
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms: u64 = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);

    parsed(lookup, name, default_ms, 0..=u64::MAX).map(Duration::from_millis)
}
