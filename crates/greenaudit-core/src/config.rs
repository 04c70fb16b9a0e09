use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GreenAuditError, Result};
use crate::judgement::{DEFAULT_FALLBACK_SCORE, SCORE_RANGE};

/// Immutable run configuration, built once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ollama,
    LlamaCpp,
}

impl BackendKind {
    pub fn default_host(self) -> &'static str {
        match self {
            BackendKind::Ollama => "http://localhost:11434",
            BackendKind::LlamaCpp => "http://localhost:8080",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: BackendKind,
    pub model_id: String,
    /// Falls back to the backend default for `backend`.
    pub host: Option<String>,
    /// Label written to every row, e.g. "FP16", "NF4", "Q4_K_M".
    pub precision: Option<String>,
    /// Raw-completion template with a `{prompt}` placeholder.
    pub prompt_template: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Ollama,
            model_id: "phi3:mini".to_string(),
            host: None,
            precision: None,
            prompt_template: None,
        }
    }
}

impl ModelConfig {
    pub fn host(&self) -> &str {
        self.host
            .as_deref()
            .unwrap_or_else(|| self.backend.default_host())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: u32,
    pub deterministic: bool,
    pub use_cache: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 200,
            deterministic: true,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilerKind {
    /// Every source available on this host, summed.
    #[default]
    Auto,
    Rapl,
    Nvidia,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub profiler: ProfilerKind,
    pub idle_duration_secs: u64,
    pub poll_interval_ms: u64,
    pub floor_j: f64,
    pub carbon_intensity_g_per_kwh: f64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            profiler: ProfilerKind::Auto,
            idle_duration_secs: 10,
            poll_interval_ms: 1000,
            floor_j: 0.01,
            carbon_intensity_g_per_kwh: 475.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeKind {
    #[default]
    None,
    Fixed,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub kind: JudgeKind,
    pub model: String,
    pub api_base: String,
    pub max_tokens: u32,
    pub fixed_score: u8,
    pub fallback_score: u8,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            kind: JudgeKind::None,
            model: "claude-haiku-4-5-20251001".to_string(),
            api_base: "https://api.anthropic.com".to_string(),
            max_tokens: 100,
            fixed_score: 8,
            fallback_score: DEFAULT_FALLBACK_SCORE,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_path: PathBuf,
    /// Write a partial snapshot every N records. 0 disables checkpoints.
    pub checkpoint_every: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_path: PathBuf::from("green_audit_results.csv"),
            checkpoint_every: 50,
        }
    }
}

impl OutputConfig {
    pub fn out_dir(&self) -> &Path {
        self.results_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// `<stem>_summary.json` next to the results file.
    pub fn summary_path(&self) -> PathBuf {
        let stem = self
            .results_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_string());
        self.out_dir().join(format!("{}_summary.json", stem))
    }

    pub fn checkpoint_path(&self, precision: &str, completed: usize) -> PathBuf {
        self.out_dir()
            .join(format!("checkpoint_{}_{}.csv", precision, completed))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub path: PathBuf,
    pub limit: Option<usize>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/prompts/green_audit_50.json"),
            limit: None,
        }
    }
}

impl AuditConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GreenAuditError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AuditConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.model_id.trim().is_empty() {
            return Err(GreenAuditError::Config("model_id is empty".into()));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(GreenAuditError::Config("max_new_tokens must be at least 1".into()));
        }
        if self.energy.floor_j.is_nan() || self.energy.floor_j <= 0.0 {
            return Err(GreenAuditError::Config(format!(
                "energy floor must be positive, got {}",
                self.energy.floor_j
            )));
        }
        if self.energy.idle_duration_secs == 0 {
            return Err(GreenAuditError::Config("idle duration must be at least 1s".into()));
        }
        if self.energy.poll_interval_ms == 0 {
            return Err(GreenAuditError::Config("poll interval must be at least 1ms".into()));
        }
        if self.energy.carbon_intensity_g_per_kwh < 0.0 {
            return Err(GreenAuditError::Config("carbon intensity cannot be negative".into()));
        }
        if self.model.backend == BackendKind::Ollama && !self.generation.use_cache {
            return Err(GreenAuditError::Config(
                "the ollama backend cannot disable its KV cache; use --backend llamacpp for use_cache=false runs".into(),
            ));
        }
        for (name, score) in [
            ("fixed_score", self.judge.fixed_score),
            ("fallback_score", self.judge.fallback_score),
        ] {
            if !SCORE_RANGE.contains(&score) {
                return Err(GreenAuditError::Config(format!(
                    "{} must be within 1..=10, got {}",
                    name, score
                )));
            }
        }
        if self.judge.kind == JudgeKind::Anthropic
            && self.judge.api_key.as_deref().map_or(true, str::is_empty)
        {
            return Err(GreenAuditError::Config(
                "anthropic judge requires ANTHROPIC_API_KEY".into(),
            ));
        }
        Ok(())
    }

    /// Precision label for output rows: configured, else reported by the
    /// backend, else "unknown".
    pub fn precision_label(&self, reported: Option<&str>) -> String {
        self.model
            .precision
            .as_deref()
            .or(reported)
            .unwrap_or("unknown")
            .to_string()
    }
}
