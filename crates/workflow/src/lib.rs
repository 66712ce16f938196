//! Durable, step-memoized analysis of uploaded objects.
//!
//! Upload notifications arrive through a [`QueueConsumer`], either polled from a
//! [`queue::QueueSource`] or handed over by Lambda via [`handle_sqs_event`].
//! Each starts an instance on the [`WorkflowExecutor`], which runs the steps of
//! [`analyse_upload`] in order and records every completed step so an
//! interrupted instance resumes where it stopped.

mod batch_handler;
pub mod config;
pub mod consumer;
pub mod context;
pub mod engine;
pub mod error;
pub mod pipeline;
mod registry;
pub mod retry;
pub mod status;

pub use crate::batch_handler::handle_sqs_event;
pub use crate::config::{ConfigError, InferenceSettings, PipelineConfig, PollerConfig};
pub use crate::consumer::{MessageOutcome, PollSummary, QueueConsumer};
pub use crate::context::StepContext;
pub use crate::engine::WorkflowExecutor;
pub use crate::error::{ConsumerError, EngineError, StepError, StepFailure};
pub use crate::pipeline::{Services, analyse_upload};
pub use crate::retry::RetryPolicy;
pub use crate::status::{StatusQuery, UploadStatus};
