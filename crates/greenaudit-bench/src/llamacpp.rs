//! llama.cpp `llama-server` backend.
//!
//! Unlike Ollama, `/completion` exposes `cache_prompt`, so runs with the KV
//! cache switched off go through this backend.

use async_trait::async_trait;
use greenaudit_core::{GreenAuditError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::generate::{Generation, GenerationRequest, Generator, ModelDescriptor};

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    cache_prompt: bool,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: String,
    #[serde(default)]
    tokens_predicted: Option<u64>,
    #[serde(default)]
    tokens_evaluated: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct PropsResponse {
    #[serde(default)]
    model_path: Option<String>,
}

/// Pull a quantization tag such as `Q4_K_M` or `F16` out of a GGUF file name.
pub fn quantization_from_path(path: &str) -> Option<String> {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file.strip_suffix(".gguf").unwrap_or(file);

    stem.split(['-', '.'])
        .rev()
        .map(|part| part.to_ascii_uppercase())
        .find(|part| {
            let is_float = matches!(part.as_str(), "F16" | "F32" | "BF16" | "FP16");
            let is_quant = part
                .strip_prefix("IQ")
                .or_else(|| part.strip_prefix('Q'))
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()));
            is_float || is_quant
        })
}

pub struct LlamaCppGenerator {
    host: String,
    model_id: String,
    client: reqwest::Client,
}

impl LlamaCppGenerator {
    pub fn new(host: &str, model_id: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<CompletionResponse> {
        let url = format!("{}/completion", self.host);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GreenAuditError::Backend(format!(
                "Completion failed: {} - {}",
                status, body
            )));
        }

        resp.json()
            .await
            .map_err(|e| GreenAuditError::Backend(format!("Failed to parse completion: {}", e)))
    }
}

#[async_trait]
impl Generator for LlamaCppGenerator {
    fn name(&self) -> &'static str {
        "llamacpp"
    }

    #[instrument(skip(self), fields(model = %self.model_id, host = %self.host))]
    async fn ensure_model(&self) -> Result<ModelDescriptor> {
        let resp = self
            .client
            .get(format!("{}/health", self.host))
            .send()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GreenAuditError::ModelNotFound(format!(
                "{} (llama-server health: {})",
                self.model_id,
                resp.status()
            )));
        }
        let health: HealthResponse = resp.json().await.unwrap_or(HealthResponse {
            status: String::new(),
        });
        debug!(status = %health.status, "llama-server healthy");

        let props: PropsResponse = match self
            .client
            .get(format!("{}/props", self.host))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or_default(),
            _ => PropsResponse::default(),
        };

        let quantization = props.model_path.as_deref().and_then(quantization_from_path);
        if let Some(path) = &props.model_path {
            if !path.contains(&self.model_id) {
                warn!(model_path = %path, "llama-server is serving a file that does not name the configured model");
            }
        }

        Ok(ModelDescriptor {
            id: props.model_path.unwrap_or_else(|| self.model_id.clone()),
            quantization,
        })
    }

    async fn warmup(&self) -> Result<()> {
        info!("Warming up model: {}", self.model_id);
        self.complete(&CompletionRequest {
            prompt: "hi",
            n_predict: 1,
            cache_prompt: false,
            stream: false,
            temperature: Some(0.0),
            seed: Some(0),
        })
        .await?;
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let (temperature, seed) = if request.deterministic {
            (Some(0.0), Some(0))
        } else {
            (None, None)
        };

        let resp = self
            .complete(&CompletionRequest {
                prompt: &request.prompt,
                n_predict: request.max_new_tokens,
                cache_prompt: request.use_cache,
                stream: false,
                temperature,
                seed,
            })
            .await?;

        Ok(Generation {
            text: resp.content.trim().to_string(),
            input_tokens: resp.tokens_evaluated.unwrap_or(0) as u32,
            output_tokens: resp.tokens_predicted.unwrap_or(0) as u32,
        })
    }
}
