mod image_prep;

use labscribe_contracts::fence::{extract_json_blocks, BlockPolicy, JsonBlock};
use labscribe_contracts::records::Artifact;
use serde_json::{json, Value};
use tracing::debug;

use crate::chat::{message_text, ChatBackend};
use crate::config::ModelConfig;
use crate::error::ConversionError;
use crate::sha256_hex;

/// What a conversion attempt was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptInput {
    Artifact {
        query_id: String,
        file_id: String,
        content_type: String,
        sha256: String,
        instruction: String,
    },
    Repair {
        prior_payload: String,
        validation_message: String,
    },
}

impl AttemptInput {
    pub fn from_artifact(artifact: &Artifact, instruction: &str) -> Self {
        Self::Artifact {
            query_id: artifact.query_id.clone(),
            file_id: artifact.file_id.clone(),
            content_type: artifact.content_type.clone(),
            sha256: sha256_hex(&artifact.bytes),
            instruction: instruction.to_string(),
        }
    }

    pub fn repair(prior_payload: &str, validation_message: &str) -> Self {
        Self::Repair {
            prior_payload: prior_payload.to_string(),
            validation_message: validation_message.to_string(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Artifact { .. } => "convert",
            Self::Repair { .. } => "reconvert",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionAttempt {
    /// Zero until the repair loop numbers the attempt.
    pub number: u32,
    pub input: AttemptInput,
    pub raw_response: String,
    pub blocks: Vec<JsonBlock>,
}

impl ConversionAttempt {
    pub fn new(input: AttemptInput, raw_response: impl Into<String>, blocks: Vec<JsonBlock>) -> Self {
        Self {
            number: 0,
            input,
            raw_response: raw_response.into(),
            blocks,
        }
    }

    pub fn with_number(mut self, number: u32) -> Self {
        self.number = number;
        self
    }
}

/// Turns a report image into candidate resource payloads.
pub trait Converter {
    fn convert(
        &self,
        artifact: &Artifact,
        instruction: &str,
    ) -> Result<ConversionAttempt, ConversionError>;

    fn reconvert(
        &self,
        prior_payload: &str,
        validation_message: &str,
    ) -> Result<ConversionAttempt, ConversionError>;
}

impl<T: Converter + ?Sized> Converter for &T {
    fn convert(
        &self,
        artifact: &Artifact,
        instruction: &str,
    ) -> Result<ConversionAttempt, ConversionError> {
        (**self).convert(artifact, instruction)
    }

    fn reconvert(
        &self,
        prior_payload: &str,
        validation_message: &str,
    ) -> Result<ConversionAttempt, ConversionError> {
        (**self).reconvert(prior_payload, validation_message)
    }
}

pub fn repair_instruction(prior_payload: &str, validation_message: &str) -> String {
    format!(
        "The following HL7 FHIR JSON failed validation.\n\n\
         Validation message: {validation_message}\n\n\
         ```json\n{}\n```\n\n\
         Return a corrected version of the same resource type as a single ```json fenced block. \
         Keep every value that was transcribed from the report.",
        prior_payload.trim()
    )
}

/// Vision converter over an OpenAI-compatible chat backend.
pub struct OpenAiConverter<B> {
    backend: B,
    model: String,
    image_max_dim: u32,
    max_output_tokens: u64,
    policy: BlockPolicy,
}

impl<B: ChatBackend> OpenAiConverter<B> {
    pub fn new(backend: B, config: &ModelConfig, policy: BlockPolicy) -> Self {
        Self {
            backend,
            model: config.model.clone(),
            image_max_dim: config.image_max_dim,
            max_output_tokens: config.max_output_tokens,
            policy,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn request(&self, content: Value) -> Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": content,
            }],
            "max_tokens": self.max_output_tokens,
        })
    }

    fn complete(&self, input: AttemptInput, request: &Value) -> Result<ConversionAttempt, ConversionError> {
        let response = self.backend.complete(request)?;
        let text = response
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .map(message_text)
            .ok_or_else(|| {
                ConversionError::InvalidResponse("response has no choices[0].message".to_string())
            })?;
        let blocks = extract_json_blocks(&text, self.policy);
        debug!(
            mode = input.mode(),
            chars = text.len(),
            blocks = blocks.len(),
            "model reply received"
        );
        Ok(ConversionAttempt::new(input, text, blocks))
    }
}

impl<B: ChatBackend> Converter for OpenAiConverter<B> {
    fn convert(
        &self,
        artifact: &Artifact,
        instruction: &str,
    ) -> Result<ConversionAttempt, ConversionError> {
        if !artifact.is_image() {
            return Err(ConversionError::UnsupportedArtifact {
                content_type: artifact.content_type.clone(),
            });
        }
        if artifact.bytes.is_empty() {
            return Err(ConversionError::Encoding(format!(
                "artifact {} has no bytes",
                artifact.file_id
            )));
        }
        let (bytes, mime) =
            image_prep::prepare_vision_image(&artifact.bytes, &artifact.content_type, self.image_max_dim);
        let request = self.request(json!([
            {"type": "text", "text": instruction},
            {"type": "image_url", "image_url": {"url": image_prep::data_url(&bytes, &mime)}},
        ]));
        self.complete(AttemptInput::from_artifact(artifact, instruction), &request)
    }

    fn reconvert(
        &self,
        prior_payload: &str,
        validation_message: &str,
    ) -> Result<ConversionAttempt, ConversionError> {
        let request = self.request(Value::String(repair_instruction(
            prior_payload,
            validation_message,
        )));
        self.complete(AttemptInput::repair(prior_payload, validation_message), &request)
    }
}
