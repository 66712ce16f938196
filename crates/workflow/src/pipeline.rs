use crate::config::InferenceSettings;
use crate::context::StepContext;
use crate::error::{StepError, StepFailure};
use lambda_runtime::tracing;
use model::{InstanceId, ObjectKey, StepName};
use service::{InferenceClient, InferenceRequest, ObjectFetcher};
use state::{SetAnalysis, TrackingStore};
use std::sync::Arc;

/// External collaborators the upload analysis calls out to.
#[derive(Clone)]
pub struct Services {
    pub tracking: Arc<dyn TrackingStore>,
    pub fetcher: Arc<dyn ObjectFetcher>,
    pub inference: Arc<dyn InferenceClient>,
}

/// Analyse one uploaded object.
///
/// 1. Point the tracking record at this instance
/// 2. Fetch the object bytes
/// 3. Describe the image
/// 4. Store the description, unless a newer instance owns the record
pub async fn analyse_upload(
    ctx: &StepContext,
    services: &Services,
    settings: &InferenceSettings,
) -> Result<String, StepFailure> {
    let object_key: &ObjectKey = ctx.object_key();
    let instance_id: &InstanceId = ctx.instance_id();

    let tracking: &dyn TrackingStore = services.tracking.as_ref();
    ctx.step(StepName::RecordInstance, move || async move {
        tracking
            .upsert(object_key, instance_id)
            .await
            .map_err(StepError::from)
    })
    .await?;

    let fetcher: &dyn ObjectFetcher = services.fetcher.as_ref();
    let image: Vec<u8> = ctx
        .step(StepName::FetchObject, move || async move {
            fetcher.fetch(object_key).await.map_err(StepError::from)
        })
        .await?;

    let inference: &dyn InferenceClient = services.inference.as_ref();
    let request: InferenceRequest<'_> = InferenceRequest {
        image: &image,
        prompt: &settings.prompt,
        max_tokens: settings.max_tokens,
    };
    let analysis: String = ctx
        .step(StepName::RunInference, move || async move {
            inference.infer(request).await.map_err(StepError::from)
        })
        .await?;

    let result: &str = &analysis;
    ctx.step(StepName::PersistResult, move || async move {
        tracking
            .set_analysis(object_key, instance_id, result)
            .await
            .map(|outcome: SetAnalysis| {
                if let SetAnalysis::MissingRecord = outcome {
                    tracing::warn!("Tracking record for {object_key} is gone, analysis not stored");
                }
            })
            .map_err(StepError::from)
    })
    .await?;

    Ok(analysis)
}

