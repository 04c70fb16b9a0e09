use async_trait::async_trait;
use greenaudit_core::{GreenAuditError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::generate::{Generation, GenerationRequest, Generator, ModelDescriptor};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDetails {
    pub quantization_level: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    raw: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn list_models(&self) -> Result<Vec<OllamaModel>> {
        let url = format!("{}/api/tags", self.host);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GreenAuditError::Backend(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        Ok(tags.models)
    }

    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        raw: bool,
        options: GenerateOptionsBuilder,
    ) -> Result<GenerateResponse> {
        let url = format!("{}/api/generate", self.host);

        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            raw,
            options: options.build(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GreenAuditError::Backend(format!(
                "Generate failed: {} - {}",
                status, body
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| {
            GreenAuditError::Backend(format!(
                "Failed to parse response: {} - Body: {}",
                e,
                truncate(&body, 500)
            ))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptionsBuilder {
    pub max_new_tokens: u32,
    pub deterministic: bool,
}

impl GenerateOptionsBuilder {
    fn build(self) -> GenerateOptions {
        let (temperature, seed) = if self.deterministic {
            (Some(0.0), Some(0))
        } else {
            (None, None)
        };
        GenerateOptions {
            num_predict: self.max_new_tokens,
            temperature,
            seed,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Ollama tags default to `:latest` when no tag is given.
fn matches_model(name: &str, wanted: &str) -> bool {
    name == wanted || (!wanted.contains(':') && name == format!("{}:latest", wanted))
}

/// Ollama-served model. The KV cache is always on for this backend.
pub struct OllamaGenerator {
    client: OllamaClient,
    model_id: String,
}

impl OllamaGenerator {
    pub fn new(host: &str, model_id: &str) -> Self {
        Self {
            client: OllamaClient::new(host),
            model_id: model_id.to_string(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &'static str {
        "ollama"
    }

    #[instrument(skip(self), fields(model = %self.model_id, host = %self.client.host()))]
    async fn ensure_model(&self) -> Result<ModelDescriptor> {
        let models = self.client.list_models().await?;
        let found = models
            .into_iter()
            .find(|m| matches_model(&m.name, &self.model_id))
            .ok_or_else(|| GreenAuditError::ModelNotFound(self.model_id.clone()))?;

        let quantization = found.details.and_then(|d| d.quantization_level);
        debug!(?quantization, "model present");

        Ok(ModelDescriptor {
            id: found.name,
            quantization,
        })
    }

    async fn warmup(&self) -> Result<()> {
        info!("Warming up model: {}", self.model_id);
        let options = GenerateOptionsBuilder {
            max_new_tokens: 1,
            deterministic: true,
        };
        self.client
            .generate(&self.model_id, "hi", false, options)
            .await?;
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let options = GenerateOptionsBuilder {
            max_new_tokens: request.max_new_tokens,
            deterministic: request.deterministic,
        };
        let resp = self
            .client
            .generate(&self.model_id, &request.prompt, request.raw, options)
            .await?;

        Ok(Generation {
            text: resp.response.trim().to_string(),
            input_tokens: resp.prompt_eval_count.unwrap_or(0) as u32,
            output_tokens: resp.eval_count.unwrap_or(0) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_options_pin_temperature_and_seed() {
        let o = GenerateOptionsBuilder {
            max_new_tokens: 200,
            deterministic: true,
        }
        .build();
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["num_predict"], 200);
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["seed"], 0);
    }

    #[test]
    fn sampling_options_leave_defaults() {
        let o = GenerateOptionsBuilder {
            max_new_tokens: 50,
            deterministic: false,
        }
        .build();
        let json = serde_json::to_value(&o).unwrap();
        assert!(json.get("temperature").is_none());
        assert!(json.get("seed").is_none());
    }

    #[test]
    fn bare_model_name_matches_latest_tag() {
        assert!(matches_model("phi3:latest", "phi3"));
        assert!(matches_model("phi3:mini", "phi3:mini"));
        assert!(!matches_model("phi3:mini", "phi3"));
        assert!(!matches_model("phi3:latest", "phi3:mini"));
    }

    #[test]
    fn parses_generate_response() {
        let body = r#"{"model":"phi3","response":" Photosynthesis is...","done":true,
            "prompt_eval_count":14,"eval_count":200,"eval_duration":4000000000}"#;
        let r: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(r.prompt_eval_count, Some(14));
        assert_eq!(r.eval_count, Some(200));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("x²y", 2), "x²");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
