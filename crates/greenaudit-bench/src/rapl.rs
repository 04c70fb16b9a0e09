//! CPU package energy from the Linux powercap interface (Intel/AMD RAPL).

use std::fs;
use std::path::{Path, PathBuf};

use greenaudit_core::{GreenAuditError, Result};
use tracing::{debug, instrument};

use crate::energy::EnergyProfiler;

const POWERCAP_ROOT: &str = "/sys/class/powercap";

#[derive(Debug)]
struct RaplDomain {
    name: String,
    energy_path: PathBuf,
    max_range_uj: u64,
    last_raw_uj: u64,
    accumulated_uj: u128,
}

impl RaplDomain {
    fn read_raw(&self) -> Result<u64> {
        read_u64(&self.energy_path)
    }

    fn reset(&mut self) -> Result<()> {
        self.last_raw_uj = self.read_raw()?;
        self.accumulated_uj = 0;
        Ok(())
    }

    /// Fold the current counter into the running total, across wraparound.
    fn update(&mut self) -> Result<u128> {
        let raw = self.read_raw()?;
        let delta = if raw >= self.last_raw_uj {
            raw - self.last_raw_uj
        } else {
            debug!(domain = %self.name, "energy counter wrapped");
            self.max_range_uj.saturating_sub(self.last_raw_uj) + raw
        };
        self.last_raw_uj = raw;
        self.accumulated_uj += u128::from(delta);
        Ok(self.accumulated_uj)
    }
}

fn read_u64(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .map_err(|e| GreenAuditError::Profiler(format!("{}: {}", path.display(), e)))?;
    content
        .trim()
        .parse()
        .map_err(|e| GreenAuditError::Profiler(format!("{}: {}", path.display(), e)))
}

/// Package-level domains only (`intel-rapl:N`); subdomains such as
/// `intel-rapl:0:0` are already counted by their parent.
fn is_package_domain(dir_name: &str) -> bool {
    dir_name
        .strip_prefix("intel-rapl:")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

pub struct RaplProfiler {
    domains: Vec<RaplDomain>,
}

impl RaplProfiler {
    pub fn detect() -> Result<Self> {
        Self::from_root(Path::new(POWERCAP_ROOT))
    }

    #[instrument]
    pub fn from_root(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|e| {
            GreenAuditError::ProfilerUnavailable(format!("rapl: {}: {}", root.display(), e))
        })?;

        let mut domains = Vec::new();
        for entry in entries.flatten() {
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if !is_package_domain(&dir_name) {
                continue;
            }

            let dir = entry.path();
            let energy_path = dir.join("energy_uj");
            let Ok(last_raw_uj) = read_u64(&energy_path) else {
                debug!(domain = %dir_name, "energy_uj unreadable, skipping");
                continue;
            };
            let max_range_uj = read_u64(&dir.join("max_energy_range_uj")).unwrap_or(u64::MAX);
            let name = fs::read_to_string(dir.join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or(dir_name);

            domains.push(RaplDomain {
                name,
                energy_path,
                max_range_uj,
                last_raw_uj,
                accumulated_uj: 0,
            });
        }

        if domains.is_empty() {
            return Err(GreenAuditError::ProfilerUnavailable(format!(
                "rapl: no readable package domains under {}",
                root.display()
            )));
        }

        domains.sort_by(|a, b| a.energy_path.cmp(&b.energy_path));
        debug!(domains = domains.len(), "RAPL profiler ready");
        Ok(Self { domains })
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    fn total_joules(&mut self) -> Result<f64> {
        let mut total_uj: u128 = 0;
        for d in &mut self.domains {
            total_uj += d.update()?;
        }
        Ok(total_uj as f64 / 1_000_000.0)
    }
}

impl EnergyProfiler for RaplProfiler {
    fn name(&self) -> &str {
        "rapl"
    }

    fn start(&mut self) -> Result<()> {
        self.domains.iter_mut().try_for_each(RaplDomain::reset)
    }

    fn sample(&mut self) -> Result<f64> {
        self.total_joules()
    }

    fn stop(&mut self) -> Result<f64> {
        self.total_joules()
    }
}
