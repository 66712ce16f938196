use crate::{InferenceClient, InferenceRequest, ServiceError};
use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::operation::converse::{ConverseError, ConverseOutput};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, ImageBlock, ImageFormat, ImageSource, InferenceConfiguration,
    Message,
};
use lambda_runtime::tracing;

/// Image description through the Bedrock Converse API.
pub struct BedrockInferenceClient {
    bedrock: aws_sdk_bedrockruntime::Client,
    model_id: String,
}

impl BedrockInferenceClient {
    pub fn new(bedrock: aws_sdk_bedrockruntime::Client, model_id: impl Into<String>) -> Self {
        Self {
            bedrock,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl InferenceClient for BedrockInferenceClient {
    async fn infer(&self, request: InferenceRequest<'_>) -> Result<String, ServiceError> {
        let image: ImageBlock = ImageBlock::builder()
            .format(image_format(request.image))
            .source(ImageSource::Bytes(Blob::new(request.image)))
            .build()
            .map_err(|err| ServiceError::Rejected(err.to_string()))?;

        let message: Message = Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Image(image))
            .content(ContentBlock::Text(request.prompt.to_string()))
            .build()
            .map_err(|err| ServiceError::Rejected(err.to_string()))?;

        let max_tokens: i32 = i32::try_from(request.max_tokens).unwrap_or(i32::MAX);

        let output: ConverseOutput = self
            .bedrock
            .converse()
            .model_id(&self.model_id)
            .messages(message)
            .inference_config(InferenceConfiguration::builder().max_tokens(max_tokens).build())
            .send()
            .await
            .map_err(|err| {
                let detail: String = DisplayErrorContext(&err).to_string();

                match err.as_service_error() {
                    Some(
                        ConverseError::ValidationException(_)
                        | ConverseError::AccessDeniedException(_)
                        | ConverseError::ResourceNotFoundException(_),
                    ) => ServiceError::Rejected(detail),
                    _ => ServiceError::Transient(detail),
                }
            })?;

        tracing::debug!(
            "Model {} stopped with reason {:?}",
            self.model_id,
            output.stop_reason()
        );

        let text: String = reply_text(&output);
        if text.trim().is_empty() {
            return Err(ServiceError::Transient(
                "model returned no text".to_string(),
            ));
        }

        Ok(text)
    }
}

fn reply_text(output: &ConverseOutput) -> String {
    output
        .output()
        .and_then(|output| output.as_message().ok())
        .map(|message| {
            message
                .content()
                .iter()
                .filter_map(|block| block.as_text().ok())
                .map(String::as_str)
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Sniff the image format from its leading bytes, assuming PNG when unknown.
pub(crate) fn image_format(image: &[u8]) -> ImageFormat {
    match image {
        [0xFF, 0xD8, 0xFF, ..] => ImageFormat::Jpeg,
        [b'G', b'I', b'F', b'8', ..] => ImageFormat::Gif,
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => ImageFormat::Webp,
        _ => ImageFormat::Png,
    }
}
