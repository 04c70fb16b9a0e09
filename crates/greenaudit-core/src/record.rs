use serde::{Deserialize, Serialize};

use crate::accounting::{learning_per_watt, EnergyReading, MIN_LATENCY_S};
use crate::judgement::Judgement;
use crate::prompts::Prompt;

/// Raw outcome of one timed, energy-sampled generation call.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub response: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_s: f64,
    pub energy: EnergyReading,
    pub use_cache: bool,
}

/// One row of the results table. Field names on disk match the CSV header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "ID")]
    pub id: u32,
    #[serde(rename = "Precision")]
    pub precision: String,
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Prompt")]
    pub prompt: String,
    #[serde(rename = "Response")]
    pub response: String,
    #[serde(rename = "Input_Tokens")]
    pub input_tokens: u32,
    #[serde(rename = "Output_Tokens")]
    pub output_tokens: u32,
    #[serde(rename = "Latency_s")]
    pub latency_s: f64,
    #[serde(rename = "Tokens_per_sec")]
    pub tokens_per_sec: f64,
    #[serde(rename = "Energy_J")]
    pub gross_energy_j: f64,
    #[serde(rename = "Net_Energy_J")]
    pub net_energy_j: f64,
    #[serde(rename = "Power_W")]
    pub power_w: f64,
    #[serde(rename = "CO2_g")]
    pub co2_g: f64,
    pub use_cache: bool,
    #[serde(rename = "Qped", default)]
    pub qped: Option<u8>,
    #[serde(rename = "Score_Reason", default)]
    pub score_reason: Option<String>,
    #[serde(rename = "LpW", default)]
    pub lpw: Option<f64>,
}

impl ResultRecord {
    /// CSV header, in field order.
    pub const COLUMNS: [&'static str; 17] = [
        "ID",
        "Precision",
        "Category",
        "Prompt",
        "Response",
        "Input_Tokens",
        "Output_Tokens",
        "Latency_s",
        "Tokens_per_sec",
        "Energy_J",
        "Net_Energy_J",
        "Power_W",
        "CO2_g",
        "use_cache",
        "Qped",
        "Score_Reason",
        "LpW",
    ];

    pub fn new(
        prompt: &Prompt,
        precision: &str,
        m: Measurement,
        judgement: Option<&Judgement>,
    ) -> Self {
        let latency_s = m.latency_s.max(MIN_LATENCY_S);
        let lpw = judgement
            .map(|j| learning_per_watt(f64::from(j.score()), m.energy.net_j, latency_s));

        Self {
            id: prompt.id,
            precision: precision.to_string(),
            category: prompt.category.clone(),
            prompt: prompt.text.clone(),
            response: m.response,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            latency_s,
            tokens_per_sec: f64::from(m.output_tokens) / latency_s,
            gross_energy_j: m.energy.gross_j,
            net_energy_j: m.energy.net_j,
            power_w: m.energy.power_w,
            co2_g: m.energy.co2_g,
            use_cache: m.use_cache,
            qped: judgement.map(Judgement::score),
            // the CSV cannot tell an empty reason from a missing one
            score_reason: judgement
                .map(Judgement::reason)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            lpw,
        }
    }
}
