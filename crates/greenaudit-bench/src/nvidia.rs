//! GPU board energy, integrated from `nvidia-smi` power readings.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use greenaudit_core::{GreenAuditError, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::energy::EnergyProfiler;

/// Sum of `power.draw` across GPUs, in watts. `[N/A]` lines are skipped.
pub fn parse_power_draw(stdout: &str) -> Result<(f64, usize)> {
    let mut total = 0.0;
    let mut gpus = 0;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.parse::<f64>() {
            Ok(w) => {
                total += w;
                gpus += 1;
            }
            Err(_) => debug!("ignoring power reading {:?}", line),
        }
    }

    if gpus == 0 {
        return Err(GreenAuditError::Profiler(
            "nvidia-smi reported no power readings".into(),
        ));
    }
    Ok((total, gpus))
}

fn query_power() -> Result<(f64, usize)> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=power.draw")
        .arg("--format=csv,noheader,nounits")
        .output();

    match output {
        Ok(out) if out.status.success() => parse_power_draw(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => Err(GreenAuditError::Profiler(format!(
            "nvidia-smi exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!("nvidia-smi not found");
            Err(GreenAuditError::ProfilerUnavailable(
                "nvidia: nvidia-smi not found - is the NVIDIA driver installed?".into(),
            ))
        }
        Err(e) => Err(GreenAuditError::Profiler(format!(
            "nvidia-smi execution failed: {}",
            e
        ))),
    }
}

/// Trapezoid-rule integration of watt samples over time.
#[derive(Debug, Default)]
pub struct PowerIntegrator {
    joules: f64,
    last: Option<(Instant, f64)>,
}

impl PowerIntegrator {
    pub fn reset(&mut self, at: Instant, watts: f64) {
        self.joules = 0.0;
        self.last = Some((at, watts));
    }

    pub fn record(&mut self, at: Instant, watts: f64) -> f64 {
        if let Some((prev_at, prev_watts)) = self.last {
            let dt = at.saturating_duration_since(prev_at).as_secs_f64();
            self.joules += (prev_watts + watts) / 2.0 * dt;
        }
        self.last = Some((at, watts));
        self.joules
    }

    pub fn joules(&self) -> f64 {
        self.joules
    }
}

pub struct NvidiaSmiProfiler {
    poll_interval: Duration,
    gpus: usize,
    integrator: Arc<Mutex<PowerIntegrator>>,
    running: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl NvidiaSmiProfiler {
    /// Probe `nvidia-smi` once; fails when no GPU power reading is available.
    #[instrument]
    pub fn detect(poll_interval: Duration) -> Result<Self> {
        let (watts, gpus) = query_power().map_err(|e| match e {
            GreenAuditError::ProfilerUnavailable(_) => e,
            other => GreenAuditError::ProfilerUnavailable(format!("nvidia: {}", other)),
        })?;
        debug!(watts, gpus, "nvidia-smi profiler ready");

        Ok(Self {
            poll_interval,
            gpus,
            integrator: Arc::new(Mutex::new(PowerIntegrator::default())),
            running: Arc::new(AtomicBool::new(false)),
            poller: None,
        })
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus
    }

    fn record_now(&self) -> Result<f64> {
        let (watts, _) = query_power()?;
        let mut integrator = self
            .integrator
            .lock()
            .map_err(|_| GreenAuditError::Profiler("power integrator poisoned".into()))?;
        Ok(integrator.record(Instant::now(), watts))
    }

    fn join_poller(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.take() {
            if handle.join().is_err() {
                warn!("nvidia-smi poller panicked");
            }
        }
    }
}

impl EnergyProfiler for NvidiaSmiProfiler {
    fn name(&self) -> &str {
        "nvidia"
    }

    #[instrument(skip(self), fields(interval_ms = self.poll_interval.as_millis() as u64))]
    fn start(&mut self) -> Result<()> {
        self.join_poller();

        let (watts, _) = query_power()?;
        self.integrator
            .lock()
            .map_err(|_| GreenAuditError::Profiler("power integrator poisoned".into()))?
            .reset(Instant::now(), watts);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let integrator = self.integrator.clone();
        let interval = self.poll_interval;

        self.poller = Some(thread::spawn(move || {
            info!("Starting nvidia-smi power polling");
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match query_power() {
                    Ok((watts, _)) => {
                        if let Ok(mut i) = integrator.lock() {
                            i.record(Instant::now(), watts);
                        }
                    }
                    Err(e) => warn!("nvidia-smi poll failed: {}", e),
                }
            }
            debug!("nvidia-smi poller stopped");
        }));

        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        self.record_now()
    }

    fn stop(&mut self) -> Result<f64> {
        self.join_poller();
        let joules = self.record_now()?;
        debug!(joules, "nvidia profiler stopped");
        Ok(joules)
    }
}

impl Drop for NvidiaSmiProfiler {
    fn drop(&mut self) {
        self.join_poller();
    }
}
