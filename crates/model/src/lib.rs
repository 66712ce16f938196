pub mod env;
pub mod event;
pub mod instance;
pub mod record;
pub mod step;

pub use event::{EventError, ObjectKey, UploadEvent};
pub use instance::{InstanceId, InstanceState, InstanceStatus, Invocation};
pub use record::WorkflowRecord;
pub use step::{StepEntry, StepName};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
