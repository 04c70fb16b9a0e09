pub mod accounting;
pub mod config;
pub mod error;
pub mod judgement;
pub mod prompts;
pub mod record;
pub mod summary;

pub use accounting::{
    joules_to_kwh, learning_per_watt, net_energy, EnergyReading,
    JOULES_PER_KWH, MIN_LATENCY_S,
};
pub use config::{
    AuditConfig, BackendKind, EnergyConfig, GenerationConfig, JudgeConfig, JudgeKind,
    ModelConfig, OutputConfig, ProfilerKind, PromptsConfig,
};
pub use error::{GreenAuditError, Result};
pub use judgement::{Judgement, DEFAULT_FALLBACK_SCORE, SCORE_RANGE, SCORING_FAILED};
pub use prompts::{category_for_index, Prompt, PromptSet};
pub use record::{Measurement, ResultRecord};
pub use summary::{summarize, AuditSummary, CategorySummary, GroupStats};
