use std::path::PathBuf;
use std::time::Duration;

use greenaudit_core::{
    summarize, AuditConfig, AuditSummary, EnergyReading, Measurement, Prompt, PromptSet, Result,
    ResultRecord,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::calibration::{calibrate_idle, IdleBaseline};
use crate::energy::{build_profiler, EnergyProfiler};
use crate::generate::{build_generator, GenerationRequest, Generator};
use crate::judge::{build_judge, QualityJudge};
use crate::output::{write_json, write_results};

/// Progress notifications emitted while an audit runs.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Calibrating { duration_secs: u64 },
    Calibrated { baseline: IdleBaseline },
    Prompt { current: usize, total: usize, category: String },
    RecordComplete { record: ResultRecord },
    Checkpoint { path: PathBuf, completed: usize },
    Done { summary: AuditSummary },
}

/// Everything known about a finished run. Written as the summary JSON.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub run_id: Uuid,
    pub model: String,
    pub backend: String,
    pub profiler: String,
    pub judge: Option<String>,
    pub precision: String,
    pub prompt_set: String,
    pub use_cache: bool,
    pub max_new_tokens: u32,
    pub idle: IdleBaseline,
    pub results_path: PathBuf,
    pub summary_path: PathBuf,
    pub summary: AuditSummary,
    #[serde(skip)]
    pub records: Vec<ResultRecord>,
}

/// Per-run constants for the measurement step.
struct MeasureContext<'a> {
    config: &'a AuditConfig,
    precision: &'a str,
    idle_watts: f64,
}

pub struct AuditRunner {
    generator: Box<dyn Generator>,
    profiler: Box<dyn EnergyProfiler>,
    judge: Option<Box<dyn QualityJudge>>,
}

impl AuditRunner {
    pub fn new(
        generator: Box<dyn Generator>,
        profiler: Box<dyn EnergyProfiler>,
        judge: Option<Box<dyn QualityJudge>>,
    ) -> Self {
        Self {
            generator,
            profiler,
            judge,
        }
    }

    /// Resolve every collaborator from the config. A missing energy source is
    /// fatal here.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        Ok(Self::new(
            build_generator(&config.model),
            build_profiler(&config.energy)?,
            build_judge(&config.judge)?,
        ))
    }

    #[instrument(skip_all, fields(model = %config.model.model_id, prompts = prompts.len()))]
    pub async fn run(
        &mut self,
        config: &AuditConfig,
        prompts: &PromptSet,
        mut on_event: impl FnMut(AuditEvent),
    ) -> Result<AuditReport> {
        config.validate()?;
        info!("Starting audit for model: {}", config.model.model_id);

        let descriptor = self.generator.ensure_model().await?;
        self.generator.warmup().await?;

        let idle_secs = config.energy.idle_duration_secs;
        on_event(AuditEvent::Calibrating {
            duration_secs: idle_secs,
        });
        let idle = calibrate_idle(self.profiler.as_mut(), Duration::from_secs(idle_secs)).await;
        on_event(AuditEvent::Calibrated { baseline: idle });

        let precision = config.precision_label(descriptor.quantization.as_deref());
        let ctx = MeasureContext {
            config,
            precision: &precision,
            idle_watts: idle.watts,
        };

        let total = prompts.len();
        let mut records: Vec<ResultRecord> = Vec::with_capacity(total);
        let every = config.output.checkpoint_every;

        self.profiler.start()?;
        for (i, prompt) in prompts.prompts.iter().enumerate() {
            info!("Prompt {}/{} [{}]", i + 1, total, prompt.category);
            on_event(AuditEvent::Prompt {
                current: i + 1,
                total,
                category: prompt.category.clone(),
            });

            let record = self.measure(&ctx, prompt).await?;
            records.push(record.clone());
            on_event(AuditEvent::RecordComplete { record });

            if every > 0 && records.len() % every == 0 {
                let path = config.output.checkpoint_path(&precision, records.len());
                write_results(&path, &records)?;
                info!("Checkpoint saved: {}", path.display());
                on_event(AuditEvent::Checkpoint {
                    path,
                    completed: records.len(),
                });
            }
        }
        if let Err(e) = self.profiler.stop() {
            warn!("Profiler stop failed: {}", e);
        }

        let summary = summarize(&records);
        let results_path = config.output.results_path.clone();
        let summary_path = config.output.summary_path();
        write_results(&results_path, &records)?;

        let report = AuditReport {
            run_id: Uuid::new_v4(),
            model: descriptor.id,
            backend: self.generator.name().to_string(),
            profiler: self.profiler.name().to_string(),
            judge: self.judge.as_ref().map(|j| j.name().to_string()),
            precision,
            prompt_set: prompts.name.clone(),
            use_cache: config.generation.use_cache,
            max_new_tokens: config.generation.max_new_tokens,
            idle,
            results_path,
            summary_path,
            summary: summary.clone(),
            records,
        };
        write_json(&report.summary_path, &report)?;
        info!(
            "Audit complete: {} records written to {}",
            report.records.len(),
            report.results_path.display()
        );

        on_event(AuditEvent::Done { summary });
        Ok(report)
    }

    /// One timed, energy-sampled generation. Generation failures end the run.
    async fn measure(&mut self, ctx: &MeasureContext<'_>, prompt: &Prompt) -> Result<ResultRecord> {
        let request = GenerationRequest::new(
            &prompt.text,
            &ctx.config.generation,
            ctx.config.model.prompt_template.as_deref(),
        );

        let e0 = self.profiler.sample()?;
        let t0 = Instant::now();
        let generation = self.generator.generate(&request).await?;
        let latency_s = t0.elapsed().as_secs_f64();
        let e1 = self.profiler.sample()?;

        let energy = EnergyReading::derive(
            e1 - e0,
            ctx.idle_watts,
            latency_s,
            ctx.config.energy.floor_j,
            ctx.config.energy.carbon_intensity_g_per_kwh,
        );
        debug!(
            latency_s,
            gross_j = energy.gross_j,
            net_j = energy.net_j,
            tokens = generation.output_tokens,
            "prompt {} measured",
            prompt.id
        );

        let judgement = match &self.judge {
            Some(judge) => Some(judge.score(&prompt.text, &generation.text).await),
            None => None,
        };

        let measurement = Measurement {
            response: generation.text,
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            latency_s,
            energy,
            use_cache: request.use_cache,
        };
        Ok(ResultRecord::new(
            prompt,
            ctx.precision,
            measurement,
            judgement.as_ref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use greenaudit_core::{GreenAuditError, Judgement};

    use super::*;
    use crate::energy::testing::{BrokenProfiler, ScriptedProfiler};
    use crate::generate::{Generation, ModelDescriptor};
    use crate::judge::FixedJudge;
    use crate::output::read_results;

    struct SleepyGenerator {
        latency: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl SleepyGenerator {
        fn new(secs: u64) -> Self {
            Self {
                latency: Duration::from_secs(secs),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Generator for SleepyGenerator {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn ensure_model(&self) -> Result<ModelDescriptor> {
            Ok(ModelDescriptor {
                id: "phi3:mini".into(),
                quantization: Some("Q4_0".into()),
            })
        }

        async fn warmup(&self) -> Result<()> {
            Ok(())
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            Ok(Generation {
                text: format!("answer to {}", request.prompt),
                input_tokens: 10,
                output_tokens: 20,
            })
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn ensure_model(&self) -> Result<ModelDescriptor> {
            Ok(ModelDescriptor {
                id: "m".into(),
                quantization: None,
            })
        }

        async fn warmup(&self) -> Result<()> {
            Ok(())
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
            Err(GreenAuditError::Backend("out of memory".into()))
        }
    }

    struct MissingModel;

    #[async_trait]
    impl Generator for MissingModel {
        fn name(&self) -> &'static str {
            "missing"
        }

        async fn ensure_model(&self) -> Result<ModelDescriptor> {
            Err(GreenAuditError::ModelNotFound("phi3:mini".into()))
        }

        async fn warmup(&self) -> Result<()> {
            Ok(())
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Generation> {
            unreachable!("generate after missing model")
        }
    }

    struct UnreachableJudge;

    #[async_trait]
    impl QualityJudge for UnreachableJudge {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn score(&self, _prompt: &str, _response: &str) -> Judgement {
            Judgement::fallback(7, "connection refused")
        }
    }

    fn config_in(dir: &Path) -> AuditConfig {
        let mut c = AuditConfig::default();
        c.output.results_path = dir.join("results.csv");
        c.output.checkpoint_every = 0;
        c
    }

    fn prompt_set(n: usize, per_category: usize) -> PromptSet {
        let categories: Vec<String> = [
            "Mathematics",
            "Science",
            "Programming_CS",
            "Humanities",
            "Meta_cognition",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let texts = (1..=n).map(|i| format!("Question {}", i)).collect();
        PromptSet::from_blocks("test", &categories, per_category, texts).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn idle_baseline_is_subtracted() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        // 50 J over the 10 s calibration, then 12 J across a 2 s call
        let mut runner = AuditRunner::new(
            Box::new(SleepyGenerator::new(2)),
            Box::new(ScriptedProfiler::new([50.0, 0.0, 12.0])),
            None,
        );

        let report = runner.run(&config, &prompt_set(1, 10), |_| {}).await.unwrap();
        // the paused clock makes both windows exact
        assert_eq!(report.idle.duration_secs, 10.0);
        assert!((report.idle.watts - 5.0).abs() < 1e-9);

        let r = &report.records[0];
        assert_eq!(r.latency_s, 2.0);
        assert_eq!(r.gross_energy_j, 12.0);
        assert!((r.net_energy_j - 2.0).abs() < 1e-9);
        assert!((r.power_w - 1.0).abs() < 1e-9);
        assert_eq!(r.precision, "Q4_0");
        assert!(r.qped.is_none() && r.lpw.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn net_energy_clamps_to_floor() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut runner = AuditRunner::new(
            Box::new(SleepyGenerator::new(2)),
            Box::new(ScriptedProfiler::new([50.0, 0.0, 3.0])),
            Some(Box::new(FixedJudge::new(8))),
        );

        let report = runner.run(&config, &prompt_set(1, 10), |_| {}).await.unwrap();
        let r = &report.records[0];
        assert_eq!(r.net_energy_j, 0.01);
        assert!((r.power_w - 0.005).abs() < 1e-12);
        // 8 / (0.01 J * 2 s)
        assert!((r.lpw.unwrap() - 400.0).abs() < 1e-9);
        assert!(r.lpw.unwrap().is_finite());
    }

    #[tokio::test(start_paused = true)]
    async fn broken_profiler_at_calibration_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut runner = AuditRunner::new(
            Box::new(SleepyGenerator::new(1)),
            Box::new(BrokenProfiler),
            None,
        );

        // calibration survives, the loop's first sample does not
        let mut calibrated = None;
        let err = runner
            .run(&config, &prompt_set(1, 10), |e| {
                if let AuditEvent::Calibrated { baseline } = e {
                    calibrated = Some(baseline);
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GreenAuditError::Profiler(_)));
        assert!(calibrated.unwrap().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn judge_failure_does_not_stop_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut runner = AuditRunner::new(
            Box::new(SleepyGenerator::new(1)),
            Box::new(ScriptedProfiler::new([0.0])),
            Some(Box::new(UnreachableJudge)),
        );

        let report = runner.run(&config, &prompt_set(3, 10), |_| {}).await.unwrap();
        assert_eq!(report.records.len(), 3);
        for r in &report.records {
            assert_eq!(r.qped, Some(7));
            assert_eq!(r.score_reason.as_deref(), Some("scoring_failed"));
            assert!(r.lpw.unwrap().is_finite());
        }
        assert_eq!(report.judge.as_deref(), Some("unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_prompts_fill_five_categories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        config.output.checkpoint_every = 10;
        config.model.precision = Some("NF4".into());

        let generator = SleepyGenerator::new(1);
        let calls = generator.calls.clone();
        let mut runner = AuditRunner::new(
            Box::new(generator),
            Box::new(ScriptedProfiler::new([20.0])),
            Some(Box::new(FixedJudge::new(8))),
        );

        let mut events = Vec::new();
        let report = runner
            .run(&config, &prompt_set(50, 10), |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(report.records.len(), 50);
        let ids: Vec<u32> = report.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());

        let cats = &report.summary.categories;
        assert_eq!(cats.len(), 5);
        assert!(cats.iter().all(|c| c.stats.count == 10));
        assert_eq!(cats[0].category, "Mathematics");
        assert_eq!(cats[4].category, "Meta_cognition");
        assert_eq!(report.records[10].category, "Science");

        for r in &report.records {
            assert!(r.net_energy_j >= 0.01);
            assert!(r.latency_s > 0.0);
            assert!(r.power_w.is_finite() && r.lpw.unwrap().is_finite());
        }

        let on_disk = read_results(&config.output.results_path).unwrap();
        assert_eq!(on_disk, report.records);
        assert!(config.output.summary_path().exists());

        for n in [10, 20, 30, 40, 50] {
            let cp = config.output.checkpoint_path("NF4", n);
            assert_eq!(read_results(&cp).unwrap().len(), n);
        }
        let checkpoints = events
            .iter()
            .filter(|e| matches!(e, AuditEvent::Checkpoint { .. }))
            .count();
        assert_eq!(checkpoints, 5);
        assert!(matches!(events.first(), Some(AuditEvent::Calibrating { duration_secs: 10 })));
        assert!(matches!(events.last(), Some(AuditEvent::Done { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut runner =
            AuditRunner::new(Box::new(FailingGenerator), Box::new(ScriptedProfiler::new([0.0])), None);

        let err = runner.run(&config, &prompt_set(5, 10), |_| {}).await.unwrap_err();
        assert!(matches!(err, GreenAuditError::Backend(_)));
        assert!(!config.output.results_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_model_stops_before_calibration() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut runner =
            AuditRunner::new(Box::new(MissingModel), Box::new(ScriptedProfiler::new([0.0])), None);

        let mut events = 0;
        let err = runner
            .run(&config, &prompt_set(5, 10), |_| events += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GreenAuditError::ModelNotFound(_)));
        assert_eq!(events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        config.generation.use_cache = false;
        let mut runner = AuditRunner::new(
            Box::new(SleepyGenerator::new(1)),
            Box::new(ScriptedProfiler::new([0.0])),
            None,
        );

        let err = runner.run(&config, &prompt_set(1, 10), |_| {}).await.unwrap_err();
        assert!(matches!(err, GreenAuditError::Config(_)));
    }
}
