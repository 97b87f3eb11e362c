//! Provider registry: maps a model selector to a capability descriptor and
//! a generation backend.

pub mod gemini;

use async_trait::async_trait;
use std::sync::Arc;
use strum::Display;

use crate::services::assets::EncodedImage;

/// Backend families recognised by selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ModelFamily {
    #[strum(serialize = "Google Gemini")]
    Gemini,
    #[strum(serialize = "OpenAI")]
    OpenAi,
    #[strum(serialize = "Anthropic Claude")]
    Anthropic,
    #[strum(serialize = "Cloudflare Workers AI")]
    WorkersAi,
}

impl ModelFamily {
    /// Only the canonical family can produce images.
    pub fn can_generate_images(self) -> bool {
        matches!(self, ModelFamily::Gemini)
    }

    /// Match a selector by prefix/substring. `None` for unrecognised values.
    pub fn detect(selector: &str) -> Option<Self> {
        let s = selector.trim().to_ascii_lowercase();
        if s.contains("gemini") || s.starts_with("models/gemini") || s.contains("imagen") {
            Some(ModelFamily::Gemini)
        } else if s.starts_with("gpt") || s.starts_with("o1") || s.starts_with("o3") || s.contains("openai") {
            Some(ModelFamily::OpenAi)
        } else if s.starts_with("claude") || s.contains("anthropic") {
            Some(ModelFamily::Anthropic)
        } else if s.starts_with("@cf/") {
            Some(ModelFamily::WorkersAi)
        } else {
            None
        }
    }
}

/// What a selected model can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub display_name: String,
    pub family: ModelFamily,
    pub can_generate_images: bool,
}

/// A backend able to composite the garment onto the subject.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_image(
        &self,
        subject: &EncodedImage,
        garment: &EncodedImage,
        prompt: &str,
        model: &str,
    ) -> Result<EncodedImage, ProviderError>;
}

/// A resolved provider: descriptor, effective model id, and backend.
#[derive(Clone)]
pub struct Provider {
    pub descriptor: CapabilityDescriptor,
    pub model: String,
    backend: Arc<dyn GenerationBackend>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("descriptor", &self.descriptor)
            .field("model", &self.model)
            .finish()
    }
}

impl Provider {
    pub fn capability_error(&self) -> ProviderError {
        ProviderError::Capability {
            model: self.model.clone(),
            family: self.descriptor.family,
        }
    }

    /// Generate the composited image. Analysis-only providers fail fast
    /// without touching the network.
    pub async fn generate_image(
        &self,
        subject: &EncodedImage,
        garment: &EncodedImage,
        prompt: &str,
    ) -> Result<EncodedImage, ProviderError> {
        if !self.descriptor.can_generate_images {
            return Err(self.capability_error());
        }
        let image = self
            .backend
            .generate_image(subject, garment, prompt, &self.model)
            .await?;
        if image.is_empty() {
            return Err(ProviderError::EmptyResult);
        }
        Ok(image)
    }
}

/// Pure selector-to-provider mapping.
#[derive(Clone)]
pub struct ProviderRegistry {
    generator: Arc<dyn GenerationBackend>,
    default_model: String,
}

impl ProviderRegistry {
    pub fn new(generator: Arc<dyn GenerationBackend>, default_model: impl Into<String>) -> Self {
        Self {
            generator,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Resolve a selector. Unrecognised selectors fall back to the canonical
    /// family with the default model id.
    pub fn resolve(&self, selector: &str) -> Provider {
        let (family, model) = match ModelFamily::detect(selector) {
            Some(family) => (family, selector.trim().to_string()),
            None => {
                tracing::warn!(
                    selector = %selector,
                    fallback = %self.default_model,
                    "Unrecognised model selector, using default generation model"
                );
                (ModelFamily::Gemini, self.default_model.clone())
            }
        };

        Provider {
            descriptor: CapabilityDescriptor {
                display_name: format!("{family} ({model})"),
                family,
                can_generate_images: family.can_generate_images(),
            },
            model,
            backend: self.generator.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(
        "The selected model \"{model}\" ({family}) can only analyze images and cannot generate them. \
         Please choose an image-generation capable model (for example a Gemini image model) and try again."
    )]
    Capability { model: String, family: ModelFamily },

    #[error("Image generation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image generation service returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("The AI model returned no image. Try a different photo or simpler instructions.")]
    EmptyResult,
}
