//! Net-energy accounting for a single generation call.
//!
//! Every profiler reports gross joules. The idle baseline measured at
//! startup is subtracted per call, and the result is floored so that the
//! downstream ratios (power, LpW) never divide by zero.

use serde::{Deserialize, Serialize};

pub const JOULES_PER_KWH: f64 = 3.6e6;

/// Latencies below this are recorded as this value.
pub const MIN_LATENCY_S: f64 = 1e-6;

pub fn joules_to_kwh(joules: f64) -> f64 {
    joules / JOULES_PER_KWH
}

/// `max(gross - idle_watts * latency, floor)`.
pub fn net_energy(gross_j: f64, idle_watts: f64, latency_s: f64, floor_j: f64) -> f64 {
    // f64::max discards NaN, so a garbage reading also lands on the floor.
    (gross_j - idle_watts * latency_s).max(floor_j)
}

/// Quality delivered per joule-second. Zero when the denominator is not positive.
pub fn learning_per_watt(qped: f64, net_j: f64, latency_s: f64) -> f64 {
    let denom = net_j * latency_s;
    if denom > 0.0 {
        qped / denom
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyReading {
    pub gross_j: f64,
    pub net_j: f64,
    pub power_w: f64,
    pub co2_g: f64,
    /// True when the idle contribution exceeded the gross reading.
    pub clamped: bool,
}

impl EnergyReading {
    pub fn derive(
        gross_j: f64,
        idle_watts: f64,
        latency_s: f64,
        floor_j: f64,
        carbon_g_per_kwh: f64,
    ) -> Self {
        let latency_s = latency_s.max(MIN_LATENCY_S);
        let gross_j = gross_j.max(0.0);
        let net_j = net_energy(gross_j, idle_watts, latency_s, floor_j);
        let clamped = gross_j - idle_watts * latency_s < floor_j;

        if clamped {
            tracing::debug!(
                gross_j,
                idle_contribution_j = idle_watts * latency_s,
                floor_j,
                "net energy clamped to floor"
            );
        }

        Self {
            gross_j,
            net_j,
            power_w: net_j / latency_s,
            co2_g: joules_to_kwh(gross_j) * carbon_g_per_kwh,
            clamped,
        }
    }
}
