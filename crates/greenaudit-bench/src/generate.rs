use async_trait::async_trait;
use greenaudit_core::{BackendKind, GenerationConfig, ModelConfig, Result};

use crate::llamacpp::LlamaCppGenerator;
use crate::ollama::OllamaGenerator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Prompt text, with the template already applied when `raw` is set.
    pub prompt: String,
    pub raw: bool,
    pub max_new_tokens: u32,
    pub deterministic: bool,
    pub use_cache: bool,
}

impl GenerationRequest {
    pub fn new(prompt: &str, generation: &GenerationConfig, template: Option<&str>) -> Self {
        let (prompt, raw) = match template {
            Some(t) => (apply_template(t, prompt), true),
            None => (prompt.to_string(), false),
        };

        Self {
            prompt,
            raw,
            max_new_tokens: generation.max_new_tokens,
            deterministic: generation.deterministic,
            use_cache: generation.use_cache,
        }
    }
}

/// Substitute `{prompt}` in a chat template.
pub fn apply_template(template: &str, prompt: &str) -> String {
    template.replace("{prompt}", prompt)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: String,
    pub quantization: Option<String>,
}

/// A text-generation backend.
///
/// `generate` blocks until the model finishes or hits `max_new_tokens`.
/// There is no cancellation.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with `ModelNotFound` when the backend does not serve the model.
    async fn ensure_model(&self) -> Result<ModelDescriptor>;

    async fn warmup(&self) -> Result<()>;

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
}

pub fn build_generator(config: &ModelConfig) -> Box<dyn Generator> {
    match config.backend {
        BackendKind::Ollama => Box::new(OllamaGenerator::new(config.host(), &config.model_id)),
        BackendKind::LlamaCpp => {
            Box::new(LlamaCppGenerator::new(config.host(), &config.model_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_wraps_prompt() {
        let t = "<|user|>\n{prompt}<|end|>\n<|assistant|>\n";
        assert_eq!(
            apply_template(t, "What is DNA?"),
            "<|user|>\nWhat is DNA?<|end|>\n<|assistant|>\n"
        );
    }

    #[test]
    fn request_without_template_is_not_raw() {
        let g = GenerationConfig {
            max_new_tokens: 120,
            deterministic: true,
            use_cache: false,
        };
        let r = GenerationRequest::new("hi", &g, None);
        assert_eq!(r.prompt, "hi");
        assert!(!r.raw);
        assert_eq!(r.max_new_tokens, 120);
        assert!(!r.use_cache);

        let r = GenerationRequest::new("hi", &g, Some("[{prompt}]"));
        assert_eq!(r.prompt, "[hi]");
        assert!(r.raw);
    }
}
