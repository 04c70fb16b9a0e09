use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use greenaudit_bench::{
    build_generator, build_profiler, calibrate_idle, probe_profilers, read_results, AuditEvent,
    AuditReport, AuditRunner,
};
use greenaudit_core::{
    summarize, AuditConfig, AuditSummary, BackendKind, GroupStats, JudgeKind, ProfilerKind,
    PromptSet,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "greenaudit")]
#[command(about = "GreenAudit - energy and Learning-per-Watt audits for local LLM inference", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full audit: idle calibration, then every prompt
    Run {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Summary format printed at the end (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Measure idle power only
    Calibrate {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Re-aggregate an existing results CSV
    Summarize {
        /// Results file written by `run`
        results: PathBuf,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// List the categories of a prompt set
    Prompts {
        /// Prompt set JSON file
        #[arg(short, long)]
        prompts: Option<PathBuf>,

        /// Print every prompt, not just the counts
        #[arg(long)]
        list: bool,
    },

    /// Show backend reachability and available energy profilers
    Status {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Ollama,
    Llamacpp,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfilerArg {
    Auto,
    Rapl,
    Nvidia,
}

#[derive(Clone, Copy, ValueEnum)]
enum JudgeArg {
    #[value(name = "none")]
    Off,
    Fixed,
    Anthropic,
}

/// Flags shared by every subcommand that touches the model or the meter.
#[derive(Args)]
struct CommonArgs {
    /// JSON config file; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generation backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Model id, e.g. phi3:mini
    #[arg(short, long)]
    model: Option<String>,

    /// Backend URL
    #[arg(long)]
    host: Option<String>,

    /// Energy source
    #[arg(long, value_enum)]
    profiler: Option<ProfilerArg>,

    /// Idle calibration length in seconds
    #[arg(long)]
    idle_secs: Option<u64>,
}

#[derive(Args)]
struct RunArgs {
    /// Prompt set JSON file
    #[arg(short, long)]
    prompts: Option<PathBuf>,

    /// Only run the first N prompts
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Precision label written to every row, e.g. FP16, NF4
    #[arg(long)]
    precision: Option<String>,

    /// Max tokens to generate per prompt
    #[arg(long)]
    max_new_tokens: Option<u32>,

    /// Disable the KV cache (llamacpp backend only)
    #[arg(long)]
    no_cache: bool,

    /// Sample instead of greedy decoding
    #[arg(long)]
    sampling: bool,

    /// Raw prompt template with a {prompt} placeholder
    #[arg(long)]
    template: Option<String>,

    /// Quality judge
    #[arg(short, long, value_enum)]
    judge: Option<JudgeArg>,

    /// Score assigned by the fixed judge
    #[arg(long)]
    fixed_score: Option<u8>,

    /// Results CSV path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write a checkpoint every N records (0 disables)
    #[arg(long)]
    checkpoint_every: Option<usize>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            common,
            run,
            format,
        } => cmd_run(&common, &run, &format).await?,
        Commands::Calibrate { common } => cmd_calibrate(&common).await?,
        Commands::Summarize { results, format } => cmd_summarize(&results, &format)?,
        Commands::Prompts { prompts, list } => cmd_prompts(prompts, list)?,
        Commands::Status { common } => cmd_status(&common).await?,
    }

    Ok(())
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(common: &CommonArgs) -> Result<AuditConfig> {
    let mut config = match &common.config {
        Some(path) => AuditConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AuditConfig::default(),
    };

    // the backend decides which host variable applies, so it goes first
    if let Some(backend) = common.backend {
        config.model.backend = match backend {
            BackendArg::Ollama => BackendKind::Ollama,
            BackendArg::Llamacpp => BackendKind::LlamaCpp,
        };
    }
    apply_env(&mut config);

    if let Some(model) = &common.model {
        config.model.model_id = model.clone();
    }
    if let Some(host) = &common.host {
        config.model.host = Some(host.clone());
    }
    if let Some(profiler) = common.profiler {
        config.energy.profiler = match profiler {
            ProfilerArg::Auto => ProfilerKind::Auto,
            ProfilerArg::Rapl => ProfilerKind::Rapl,
            ProfilerArg::Nvidia => ProfilerKind::Nvidia,
        };
    }
    if let Some(secs) = common.idle_secs {
        config.energy.idle_duration_secs = secs;
    }

    Ok(config)
}

fn apply_env(config: &mut AuditConfig) {
    let host_var = match config.model.backend {
        BackendKind::Ollama => "OLLAMA_HOST",
        BackendKind::LlamaCpp => "LLAMACPP_HOST",
    };
    if let Ok(host) = std::env::var(host_var) {
        debug!("{} from environment", host_var);
        config.model.host = Some(host);
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        config.judge.api_key = Some(key);
    }
}

fn apply_run_args(config: &mut AuditConfig, run: &RunArgs) {
    if let Some(path) = &run.prompts {
        config.prompts.path = path.clone();
    }
    if run.limit.is_some() {
        config.prompts.limit = run.limit;
    }
    if let Some(precision) = &run.precision {
        config.model.precision = Some(precision.clone());
    }
    if let Some(n) = run.max_new_tokens {
        config.generation.max_new_tokens = n;
    }
    if run.no_cache {
        config.generation.use_cache = false;
    }
    if run.sampling {
        config.generation.deterministic = false;
    }
    if let Some(template) = &run.template {
        config.model.prompt_template = Some(template.clone());
    }
    if let Some(judge) = run.judge {
        config.judge.kind = match judge {
            JudgeArg::Off => JudgeKind::None,
            JudgeArg::Fixed => JudgeKind::Fixed,
            JudgeArg::Anthropic => JudgeKind::Anthropic,
        };
    }
    if let Some(score) = run.fixed_score {
        config.judge.fixed_score = score;
    }
    if let Some(path) = &run.output {
        config.output.results_path = path.clone();
    }
    if let Some(n) = run.checkpoint_every {
        config.output.checkpoint_every = n;
    }
}

fn load_prompts(path: &Path, limit: Option<usize>) -> Result<PromptSet> {
    let set = PromptSet::load(path).with_context(|| format!("loading prompts {}", path.display()))?;
    Ok(match limit {
        Some(n) => set.limit(n),
        None => set,
    })
}

/// Streams used by `run`. With JSON output, stdout carries only the report
/// and progress goes to stderr.
struct RunOutput<O, E> {
    stdout: O,
    stderr: E,
    json: bool,
}

impl<O: Write, E: Write> RunOutput<O, E> {
    fn new(format: &str, stdout: O, stderr: E) -> Self {
        Self {
            stdout,
            stderr,
            json: format == "json",
        }
    }

    fn progress(&mut self) -> &mut dyn Write {
        if self.json {
            &mut self.stderr
        } else {
            &mut self.stdout
        }
    }

    fn report(&mut self) -> &mut dyn Write {
        &mut self.stdout
    }
}

async fn cmd_run(common: &CommonArgs, run: &RunArgs, format: &str) -> Result<()> {
    let mut config = load_config(common)?;
    apply_run_args(&mut config, run);
    config.validate()?;

    let prompts = load_prompts(&config.prompts.path, config.prompts.limit)?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts to run");
    }

    let mut output = RunOutput::new(format, io::stdout(), io::stderr());
    write_header(output.progress(), &config, &prompts)?;

    let mut runner = AuditRunner::from_config(&config)?;
    let report = runner
        .run(&config, &prompts, |event| {
            if let Err(e) = write_event(output.progress(), event) {
                debug!("progress write failed: {}", e);
            }
        })
        .await?;

    write_report(output.report(), &report, format)?;
    Ok(())
}

fn write_header(out: &mut dyn Write, config: &AuditConfig, prompts: &PromptSet) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Running audit...")?;
    writeln!(out, "  Model:      {}", config.model.model_id)?;
    writeln!(out, "  Backend:    {:?} @ {}", config.model.backend, config.model.host())?;
    writeln!(out, "  Prompts:    {} ({})", prompts.len(), prompts.name)?;
    writeln!(out, "  KV cache:   {}", config.generation.use_cache)?;
    writeln!(out, "  Judge:      {:?}", config.judge.kind)?;
    writeln!(out)
}

fn write_event(out: &mut dyn Write, event: AuditEvent) -> io::Result<()> {
    match event {
        AuditEvent::Calibrating { duration_secs } => {
            writeln!(out, "Measuring idle power for {}s, keep the machine quiet...", duration_secs)
        }
        AuditEvent::Calibrated { baseline } if baseline.degraded => {
            writeln!(out, "  Idle calibration failed, net energy equals gross energy")
        }
        AuditEvent::Calibrated { baseline } => {
            writeln!(out, "  Idle power: {:.2} W", baseline.watts)
        }
        AuditEvent::Prompt {
            current,
            total,
            category,
        } => {
            write!(out, "[{}/{}] {:<16} ", current, total, category)?;
            out.flush()
        }
        AuditEvent::RecordComplete { record } => {
            let score = record
                .qped
                .map(|q| format!("  Qped {}", q))
                .unwrap_or_default();
            writeln!(
                out,
                "{:>6.2}s {:>9.3} J net {:>7.1} t/s{}",
                record.latency_s, record.net_energy_j, record.tokens_per_sec, score
            )
        }
        AuditEvent::Checkpoint { path, completed } => {
            writeln!(out, "  Checkpoint ({} records): {}", completed, path.display())
        }
        AuditEvent::Done { .. } => Ok(()),
    }
}

fn write_report(out: &mut dyn Write, report: &AuditReport, format: &str) -> Result<()> {
    match format {
        "json" => writeln!(out, "{}", serde_json::to_string_pretty(report)?)?,
        _ => {
            writeln!(out)?;
            writeln!(out, "  Precision:  {}", report.precision)?;
            writeln!(out, "  Profiler:   {}", report.profiler)?;
            writeln!(out, "  Idle power: {:.2} W", report.idle.watts)?;
            write_summary_table(out, &report.summary)?;
            writeln!(out, "  Results:    {}", report.results_path.display())?;
            writeln!(out, "  Summary:    {}", report.summary_path.display())?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_stats_row(out: &mut dyn Write, label: &str, s: &GroupStats) -> io::Result<()> {
    let lpw = s.avg_lpw.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".into());
    writeln!(
        out,
        "  {:<16} {:>5} {:>10.2} {:>12.3} {:>9.2} {:>9.1} {:>10}",
        label, s.count, s.avg_latency_s, s.avg_net_energy_j, s.avg_power_w, s.avg_tokens_per_sec, lpw
    )
}

fn write_summary_table(out: &mut dyn Write, summary: &AuditSummary) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Results:")?;
    writeln!(out, "{:-<80}", "")?;
    writeln!(
        out,
        "  {:<16} {:>5} {:>10} {:>12} {:>9} {:>9} {:>10}",
        "Category", "N", "Latency s", "Net J", "Power W", "Tok/s", "LpW"
    )?;
    writeln!(out, "{:-<80}", "")?;
    for c in &summary.categories {
        write_stats_row(out, &c.category, &c.stats)?;
    }
    writeln!(out, "{:-<80}", "")?;
    write_stats_row(out, "Overall", &summary.overall)?;
    writeln!(out)?;
    writeln!(
        out,
        "  Latency range:    {:.2} - {:.2} s",
        summary.min_latency_s, summary.max_latency_s
    )?;
    writeln!(
        out,
        "  Net energy range: {:.3} - {:.3} J",
        summary.min_net_energy_j, summary.max_net_energy_j
    )?;
    writeln!(out, "  Total energy:     {:.1} J gross", summary.overall.total_gross_energy_j)?;
    writeln!(out, "  Total CO2:        {:.3} g", summary.overall.total_co2_g)?;
    if let Some(m) = summary.median_lpw {
        writeln!(out, "  Median LpW:       {:.3}", m)?;
    }
    Ok(())
}

async fn cmd_calibrate(common: &CommonArgs) -> Result<()> {
    let config = load_config(common)?;
    config.validate()?;

    let mut profiler = build_profiler(&config.energy)?;
    let duration = Duration::from_secs(config.energy.idle_duration_secs);
    println!("Measuring idle power with {} for {:?}...", profiler.name(), duration);

    let baseline = calibrate_idle(profiler.as_mut(), duration).await;
    if baseline.degraded {
        anyhow::bail!("profiler {} produced no reading", profiler.name());
    }

    println!();
    println!("Idle Baseline:");
    println!("{:-<40}", "");
    println!("  Power:    {:.2} W", baseline.watts);
    println!("  Energy:   {:.2} J", baseline.joules);
    println!("  Duration: {:.1} s", baseline.duration_secs);
    println!();

    Ok(())
}

fn cmd_summarize(path: &Path, format: &str) -> Result<()> {
    let records =
        read_results(path).with_context(|| format!("reading results {}", path.display()))?;
    info!("Loaded {} records from {}", records.len(), path.display());
    let summary = summarize(&records);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "csv" => {
            println!("category,count,avg_latency_s,avg_net_energy_j,avg_power_w,avg_tokens_per_sec,avg_lpw");
            let rows = summary
                .categories
                .iter()
                .map(|c| (c.category.as_str(), &c.stats))
                .chain(std::iter::once(("overall", &summary.overall)));
            for (label, s) in rows {
                println!(
                    "{},{},{:.4},{:.4},{:.4},{:.2},{}",
                    label,
                    s.count,
                    s.avg_latency_s,
                    s.avg_net_energy_j,
                    s.avg_power_w,
                    s.avg_tokens_per_sec,
                    s.avg_lpw.map(|v| format!("{:.4}", v)).unwrap_or_default()
                );
            }
        }
        _ => {
            let mut out = io::stdout();
            write_summary_table(&mut out, &summary)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

fn cmd_prompts(path: Option<PathBuf>, list: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| AuditConfig::default().prompts.path);
    let set = load_prompts(&path, None)?;

    println!();
    println!("Prompt set: {} ({} prompts)", set.name, set.len());
    println!("{:-<40}", "");
    for (category, count) in set.category_counts() {
        println!("  {:<20} {}", category, count);
    }

    if list {
        println!();
        for p in &set.prompts {
            println!("  {:>3} [{}] {}", p.id, p.category, p.text);
        }
    }
    println!();

    Ok(())
}

async fn cmd_status(common: &CommonArgs) -> Result<()> {
    let config = load_config(common)?;

    println!("System Status:");
    println!("{:-<40}", "");
    println!("  Backend: {:?} @ {}", config.model.backend, config.model.host());

    let generator = build_generator(&config.model);
    match generator.ensure_model().await {
        Ok(model) => println!(
            "  Model:   {} ({})",
            model.id,
            model.quantization.as_deref().unwrap_or("unknown precision")
        ),
        Err(e) => println!("  Model:   unavailable ({})", e),
    }

    println!();
    println!("Energy profilers:");
    for probe in probe_profilers(&config.energy) {
        let state = if probe.available { "available" } else { "missing" };
        println!("  {:<8} {:<10} {}", probe.name, state, probe.detail);
    }

    println!();
    let key = if config.judge.api_key.is_some() { "set" } else { "not set" };
    println!("  ANTHROPIC_API_KEY: {}", key);

    Ok(())
}
