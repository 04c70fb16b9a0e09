pub mod calibration;
pub mod energy;
pub mod generate;
pub mod judge;
pub mod llamacpp;
pub mod nvidia;
pub mod ollama;
pub mod output;
pub mod rapl;
pub mod runner;

pub use calibration::{calibrate_idle, IdleBaseline};
pub use energy::{build_profiler, probe_profilers, CompositeProfiler, EnergyProfiler, ProfilerProbe};
pub use generate::{build_generator, Generation, GenerationRequest, Generator, ModelDescriptor};
pub use judge::{build_judge, parse_verdict, AnthropicJudge, FixedJudge, QualityJudge};
pub use llamacpp::LlamaCppGenerator;
pub use nvidia::NvidiaSmiProfiler;
pub use ollama::{OllamaClient, OllamaGenerator};
pub use output::{read_results, write_json, write_results};
pub use rapl::RaplProfiler;
pub use runner::{AuditEvent, AuditReport, AuditRunner};
