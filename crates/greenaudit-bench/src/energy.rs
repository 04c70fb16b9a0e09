use std::time::Duration;

use greenaudit_core::{EnergyConfig, GreenAuditError, ProfilerKind, Result};
use tracing::{info, warn};

use crate::nvidia::NvidiaSmiProfiler;
use crate::rapl::RaplProfiler;

/// A cumulative energy counter.
///
/// `sample` and `stop` return joules accumulated since the last `start`.
/// A profiler can be restarted after `stop`.
pub trait EnergyProfiler: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    fn sample(&mut self) -> Result<f64>;

    fn stop(&mut self) -> Result<f64>;
}

/// Sums several profilers, e.g. CPU package and GPU.
pub struct CompositeProfiler {
    children: Vec<Box<dyn EnergyProfiler>>,
    name: String,
}

impl CompositeProfiler {
    pub fn new(children: Vec<Box<dyn EnergyProfiler>>) -> Self {
        let name = children
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("+");
        Self { children, name }
    }
}

impl EnergyProfiler for CompositeProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        self.children.iter_mut().try_for_each(|c| c.start())
    }

    fn sample(&mut self) -> Result<f64> {
        self.children.iter_mut().map(|c| c.sample()).sum()
    }

    fn stop(&mut self) -> Result<f64> {
        self.children.iter_mut().map(|c| c.stop()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ProfilerProbe {
    pub name: &'static str,
    pub available: bool,
    pub detail: String,
}

/// Report which energy sources this host exposes, without keeping them.
pub fn probe_profilers(config: &EnergyConfig) -> Vec<ProfilerProbe> {
    let rapl = match RaplProfiler::detect() {
        Ok(p) => ProfilerProbe {
            name: "rapl",
            available: true,
            detail: format!("{} domain(s)", p.domain_count()),
        },
        Err(e) => ProfilerProbe {
            name: "rapl",
            available: false,
            detail: e.to_string(),
        },
    };

    let interval = Duration::from_millis(config.poll_interval_ms);
    let nvidia = match NvidiaSmiProfiler::detect(interval) {
        Ok(p) => ProfilerProbe {
            name: "nvidia",
            available: true,
            detail: format!("{} GPU(s)", p.gpu_count()),
        },
        Err(e) => ProfilerProbe {
            name: "nvidia",
            available: false,
            detail: e.to_string(),
        },
    };

    vec![rapl, nvidia]
}

/// Construct the configured profiler. No usable source is fatal.
pub fn build_profiler(config: &EnergyConfig) -> Result<Box<dyn EnergyProfiler>> {
    let interval = Duration::from_millis(config.poll_interval_ms);

    match config.profiler {
        ProfilerKind::Rapl => Ok(Box::new(RaplProfiler::detect()?)),
        ProfilerKind::Nvidia => Ok(Box::new(NvidiaSmiProfiler::detect(interval)?)),
        ProfilerKind::Auto => {
            let mut found: Vec<Box<dyn EnergyProfiler>> = Vec::new();
            let mut reasons = Vec::new();

            match RaplProfiler::detect() {
                Ok(p) => found.push(Box::new(p)),
                Err(e) => reasons.push(e.to_string()),
            }
            match NvidiaSmiProfiler::detect(interval) {
                Ok(p) => found.push(Box::new(p)),
                Err(e) => reasons.push(e.to_string()),
            }

            for reason in &reasons {
                warn!("Energy source skipped: {}", reason);
            }

            match found.len() {
                0 => Err(GreenAuditError::ProfilerUnavailable(reasons.join("; "))),
                1 => {
                    let only = found.remove(0);
                    info!("Energy profiler: {}", only.name());
                    Ok(only)
                }
                _ => {
                    let composite = CompositeProfiler::new(found);
                    info!("Energy profiler: {}", composite.name());
                    Ok(Box::new(composite))
                }
            }
        }
    }
}
