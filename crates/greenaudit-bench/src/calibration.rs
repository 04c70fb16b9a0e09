use std::time::Duration;

use greenaudit_core::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::energy::EnergyProfiler;

/// Idle power drawn with no inference running, subtracted from every
/// measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdleBaseline {
    pub watts: f64,
    pub joules: f64,
    pub duration_secs: f64,
    /// The profiler failed during calibration and `watts` is 0.
    pub degraded: bool,
}

impl IdleBaseline {
    fn degraded(duration_secs: f64) -> Self {
        Self {
            watts: 0.0,
            joules: 0.0,
            duration_secs,
            degraded: true,
        }
    }
}

async fn measure_idle(profiler: &mut dyn EnergyProfiler, duration: Duration) -> Result<(f64, f64)> {
    profiler.start()?;
    let started = Instant::now();
    tokio::time::sleep(duration).await;
    let joules = profiler.sample()?;
    let elapsed = started.elapsed().as_secs_f64();

    if let Err(e) = profiler.stop() {
        warn!("Profiler stop after calibration failed: {}", e);
    }
    Ok((joules, elapsed))
}

/// Sample the profiler for `duration` while the machine sits idle.
///
/// Never fails: a profiler error degrades the baseline to 0 W, so net energy
/// equals gross energy for the rest of the run.
#[instrument(skip(profiler), fields(profiler = %profiler.name()))]
pub async fn calibrate_idle(profiler: &mut dyn EnergyProfiler, duration: Duration) -> IdleBaseline {
    info!("Measuring idle power for {:?}", duration);

    match measure_idle(profiler, duration).await {
        Ok((joules, elapsed)) => {
            let secs = if elapsed > 0.0 {
                elapsed
            } else {
                duration.as_secs_f64()
            };
            let watts = if secs > 0.0 { (joules / secs).max(0.0) } else { 0.0 };
            info!("Idle power: {:.2} W ({:.2} J over {:.1} s)", watts, joules, secs);
            IdleBaseline {
                watts,
                joules,
                duration_secs: secs,
                degraded: false,
            }
        }
        Err(e) => {
            warn!("Idle calibration failed, assuming 0 W: {}", e);
            IdleBaseline::degraded(duration.as_secs_f64())
        }
    }
}
