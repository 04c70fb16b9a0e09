//! Per-category and global aggregates over a finished (or partial) run.

use serde::{Deserialize, Serialize};

use crate::record::ResultRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub avg_latency_s: f64,
    pub avg_net_energy_j: f64,
    pub avg_power_w: f64,
    pub avg_gross_energy_j: f64,
    pub avg_tokens_per_sec: f64,
    pub avg_output_tokens: f64,
    /// Only over scored records; `None` when nothing was scored.
    pub avg_qped: Option<f64>,
    pub avg_lpw: Option<f64>,
    pub total_latency_s: f64,
    pub total_gross_energy_j: f64,
    pub total_net_energy_j: f64,
    pub total_co2_g: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: String,
    #[serde(flatten)]
    pub stats: GroupStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub overall: GroupStats,
    pub categories: Vec<CategorySummary>,
    pub min_latency_s: f64,
    pub max_latency_s: f64,
    pub min_net_energy_j: f64,
    pub max_net_energy_j: f64,
    pub median_lpw: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// `(min, max)` of a field, `(0, 0)` for an empty run.
fn extent(records: &[ResultRecord], f: impl Fn(&ResultRecord) -> f64) -> (f64, f64) {
    records
        .iter()
        .map(f)
        .fold(None, |acc: Option<(f64, f64)>, v| {
            Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
        })
        .unwrap_or((0.0, 0.0))
}

fn group_stats(records: &[&ResultRecord]) -> GroupStats {
    let it = || records.iter().copied();

    GroupStats {
        count: records.len(),
        avg_latency_s: mean(it().map(|r| r.latency_s)).unwrap_or(0.0),
        avg_net_energy_j: mean(it().map(|r| r.net_energy_j)).unwrap_or(0.0),
        avg_power_w: mean(it().map(|r| r.power_w)).unwrap_or(0.0),
        avg_gross_energy_j: mean(it().map(|r| r.gross_energy_j)).unwrap_or(0.0),
        avg_tokens_per_sec: mean(it().map(|r| r.tokens_per_sec)).unwrap_or(0.0),
        avg_output_tokens: mean(it().map(|r| f64::from(r.output_tokens))).unwrap_or(0.0),
        avg_qped: mean(it().filter_map(|r| r.qped.map(f64::from))),
        avg_lpw: mean(it().filter_map(|r| r.lpw)),
        total_latency_s: it().map(|r| r.latency_s).sum(),
        total_gross_energy_j: it().map(|r| r.gross_energy_j).sum(),
        total_net_energy_j: it().map(|r| r.net_energy_j).sum(),
        total_co2_g: it().map(|r| r.co2_g).sum(),
    }
}

/// Group records by category (first-appearance order) and fold the aggregates.
pub fn summarize(records: &[ResultRecord]) -> AuditSummary {
    let mut groups: Vec<(&str, Vec<&ResultRecord>)> = Vec::new();
    for r in records {
        match groups.iter_mut().find(|(c, _)| *c == r.category) {
            Some((_, members)) => members.push(r),
            None => groups.push((r.category.as_str(), vec![r])),
        }
    }

    let categories = groups
        .iter()
        .map(|(category, members)| CategorySummary {
            category: category.to_string(),
            stats: group_stats(members),
        })
        .collect();

    let all: Vec<&ResultRecord> = records.iter().collect();
    let (min_latency_s, max_latency_s) = extent(records, |r| r.latency_s);
    let (min_net_energy_j, max_net_energy_j) = extent(records, |r| r.net_energy_j);

    AuditSummary {
        overall: group_stats(&all),
        categories,
        min_latency_s,
        max_latency_s,
        min_net_energy_j,
        max_net_energy_j,
        median_lpw: median(records.iter().filter_map(|r| r.lpw).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, category: &str, latency_s: f64, net_j: f64, lpw: Option<f64>) -> ResultRecord {
        ResultRecord {
            id,
            precision: "FP16".into(),
            category: category.into(),
            prompt: format!("prompt {id}"),
            response: "ok".into(),
            input_tokens: 10,
            output_tokens: 20,
            latency_s,
            tokens_per_sec: 20.0 / latency_s,
            gross_energy_j: net_j + 1.0,
            net_energy_j: net_j,
            power_w: net_j / latency_s,
            co2_g: 0.5,
            use_cache: false,
            qped: lpw.map(|_| 8),
            score_reason: lpw.map(|_| "fine".to_string()),
            lpw,
        }
    }

    fn sample() -> Vec<ResultRecord> {
        vec![
            record(1, "Science", 2.0, 4.0, Some(1.0)),
            record(2, "Math", 1.0, 2.0, Some(4.0)),
            record(3, "Science", 4.0, 8.0, Some(0.25)),
            record(4, "Math", 3.0, 6.0, None),
        ]
    }

    #[test]
    fn categories_keep_first_appearance_order() {
        let s = summarize(&sample());
        let names: Vec<_> = s.categories.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, vec!["Science", "Math"]);
    }

    #[test]
    fn per_category_means() {
        let s = summarize(&sample());
        let science = &s.categories[0].stats;
        assert_eq!(science.count, 2);
        assert!((science.avg_latency_s - 3.0).abs() < 1e-12);
        assert!((science.avg_net_energy_j - 6.0).abs() < 1e-12);
        assert!((science.avg_power_w - 2.0).abs() < 1e-12);

        let math = &s.categories[1].stats;
        assert_eq!(math.avg_lpw, Some(4.0));
        assert_eq!(math.avg_qped, Some(8.0));
    }

    #[test]
    fn global_extrema_and_median() {
        let s = summarize(&sample());
        assert_eq!(s.overall.count, 4);
        assert_eq!(s.min_latency_s, 1.0);
        assert_eq!(s.max_latency_s, 4.0);
        assert_eq!(s.min_net_energy_j, 2.0);
        assert_eq!(s.max_net_energy_j, 8.0);
        assert_eq!(s.median_lpw, Some(1.0));
        assert!((s.overall.total_net_energy_j - 20.0).abs() < 1e-12);
        assert!((s.overall.total_co2_g - 2.0).abs() < 1e-12);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let records = sample();
        assert_eq!(summarize(&records), summarize(&records));
    }

    #[test]
    fn empty_run_has_zeroed_summary() {
        let s = summarize(&[]);
        assert_eq!(s.overall.count, 0);
        assert_eq!(s.overall.avg_latency_s, 0.0);
        assert!(s.categories.is_empty());
        assert!(s.median_lpw.is_none());
    }

    #[test]
    fn even_length_median_averages_middle_pair() {
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }
}
