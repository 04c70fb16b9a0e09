use async_trait::async_trait;
use greenaudit_core::{GreenAuditError, JudgeConfig, JudgeKind, Judgement, Result, SCORE_RANGE};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

const RUBRIC: &str = r#"You grade answers written by an AI tutor for students.

Give the answer a whole-number score from 1 to 10:
- 9-10: correct and clear, pitched at the learner, uses an example or analogy, builds up step by step
- 7-8: mostly correct and clear, with small gaps or rough spots
- 5-6: partly correct, with confused passages or missing key ideas
- 3-4: mostly wrong or unclear, with a little relevant content
- 1-2: wrong, off-topic, or unreadable

Reply with a single JSON object and nothing else, for example:
{"score": 8, "reason": "one sentence explanation"}"#;

/// Scores a model response for pedagogical quality.
///
/// Never fails. A judge that cannot produce a score returns
/// `Judgement::Fallback`, and the run carries on.
#[async_trait]
pub trait QualityJudge: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, prompt: &str, response: &str) -> Judgement;
}

/// The same score for every response.
pub struct FixedJudge {
    score: u8,
}

impl FixedJudge {
    pub fn new(score: u8) -> Self {
        Self { score }
    }
}

#[async_trait]
impl QualityJudge for FixedJudge {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn score(&self, _prompt: &str, _response: &str) -> Judgement {
        Judgement::Scored {
            score: self.score,
            reason: "fixed".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
}

fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // drop a language tag such as ```json
    match inner.find('\n') {
        Some(nl) if !inner[..nl].trim_start().starts_with('{') => inner[nl + 1..].trim(),
        _ => inner.trim(),
    }
}

/// Parse `{"score": n, "reason": "..."}` out of the judge's reply text.
pub fn parse_verdict(text: &str) -> Result<(u8, String)> {
    let verdict: Verdict = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| GreenAuditError::Judge(format!("unparseable verdict: {}", e)))?;

    let score = match verdict.score {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| GreenAuditError::Judge("verdict has no numeric score".into()))?;

    let (lo, hi) = (f64::from(*SCORE_RANGE.start()), f64::from(*SCORE_RANGE.end()));
    if score.fract() != 0.0 || score < lo || score > hi {
        return Err(GreenAuditError::Judge(format!("score {} outside 1..=10", score)));
    }

    Ok((score as u8, verdict.reason.unwrap_or_default()))
}

/// LLM-as-judge over the Anthropic Messages API. One request per response,
/// no retries.
pub struct AnthropicJudge {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    fallback_score: u8,
}

impl AnthropicJudge {
    pub fn new(config: &JudgeConfig, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            fallback_score: config.fallback_score,
        }
    }

    async fn request_verdict(&self, prompt: &str, response: &str) -> Result<(u8, String)> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: RUBRIC,
            messages: vec![Message {
                role: "user",
                content: format!("PROMPT: {}\n\nAI RESPONSE: {}", prompt, response),
            }],
        };

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GreenAuditError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(GreenAuditError::Judge(format!("{} - {}", status, text)));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| GreenAuditError::Judge(format!("Failed to parse response: {}", e)))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|b| b.text)
            .ok_or_else(|| GreenAuditError::Judge("No response content".into()))?;
        debug!(reply = %text, "judge reply");

        parse_verdict(&text)
    }
}

#[async_trait]
impl QualityJudge for AnthropicJudge {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn score(&self, prompt: &str, response: &str) -> Judgement {
        match self.request_verdict(prompt, response).await {
            Ok((score, reason)) => Judgement::Scored { score, reason },
            Err(e) => {
                warn!("Scoring failed, using fallback {}: {}", self.fallback_score, e);
                Judgement::fallback(self.fallback_score, e.to_string())
            }
        }
    }
}

/// `None` when scoring is switched off.
pub fn build_judge(config: &JudgeConfig) -> Result<Option<Box<dyn QualityJudge>>> {
    match config.kind {
        JudgeKind::None => Ok(None),
        JudgeKind::Fixed => Ok(Some(Box::new(FixedJudge::new(config.fixed_score)))),
        JudgeKind::Anthropic => {
            let key = config
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    GreenAuditError::Config("anthropic judge requires ANTHROPIC_API_KEY".into())
                })?;
            Ok(Some(Box::new(AnthropicJudge::new(config, key))))
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answer one request with a canned status and body. Returns the base URL.
    async fn canned_api(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            // read the whole request so closing the socket does not reset it
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let resp = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn judge_at(api_base: String) -> AnthropicJudge {
        let config = JudgeConfig {
            kind: JudgeKind::Anthropic,
            api_base,
            ..JudgeConfig::default()
        };
        AnthropicJudge::new(&config, "test-key")
    }

    fn assert_fallback(j: &Judgement) {
        assert!(j.is_fallback(), "expected fallback, got {:?}", j);
        assert_eq!(j.score(), 7);
        assert_eq!(j.reason(), "scoring_failed");
    }

    #[test]
    fn parses_plain_verdict() {
        let (s, r) = parse_verdict(r#" {"score": 9, "reason": "uses a garden analogy"} "#).unwrap();
        assert_eq!(s, 9);
        assert_eq!(r, "uses a garden analogy");
    }

    #[test]
    fn tolerates_code_fences_and_string_scores() {
        let text = "```json\n{\"score\": \"6\", \"reason\": \"misses osmosis\"}\n```";
        assert_eq!(parse_verdict(text).unwrap().0, 6);

        let text = "```{\"score\": 4}```";
        let (s, r) = parse_verdict(text).unwrap();
        assert_eq!(s, 4);
        assert!(r.is_empty());
    }

    #[test]
    fn rejects_bad_verdicts() {
        assert!(parse_verdict("Score: 8").is_err());
        assert!(parse_verdict(r#"{"reason": "no score"}"#).is_err());
        assert!(parse_verdict(r#"{"score": 11}"#).is_err());
        assert!(parse_verdict(r#"{"score": 0}"#).is_err());
        assert!(parse_verdict(r#"{"score": 7.5}"#).is_err());
        assert!(parse_verdict(r#"{"score": null}"#).is_err());
    }

    #[test]
    fn request_body_shape() {
        let body = MessagesRequest {
            model: "claude-haiku-4-5-20251001",
            max_tokens: 100,
            system: RUBRIC,
            messages: vec![Message {
                role: "user",
                content: "PROMPT: p\n\nAI RESPONSE: r".into(),
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["max_tokens"], 100);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["system"].as_str().unwrap().contains("1 to 10"));
    }

    #[tokio::test]
    async fn unreachable_api_falls_back() {
        let config = JudgeConfig {
            kind: JudgeKind::Anthropic,
            api_base: "http://127.0.0.1:9".into(),
            ..JudgeConfig::default()
        };
        let judge = AnthropicJudge::new(&config, "test-key");
        let j = judge.score("What is DNA?", "A molecule.").await;
        assert!(j.is_fallback());
        assert_eq!(j.score(), 7);
        assert_eq!(j.reason(), "scoring_failed");
    }

    #[tokio::test]
    async fn scores_a_well_formed_reply() {
        let base = canned_api(
            "200 OK",
            r#"{"content":[{"type":"text","text":"{\"score\": 9, \"reason\": \"clear\"}"}]}"#,
        )
        .await;
        let j = judge_at(base).score("What is DNA?", "A molecule.").await;
        assert_eq!(
            j,
            Judgement::Scored {
                score: 9,
                reason: "clear".into()
            }
        );
    }

    #[tokio::test]
    async fn server_error_falls_back() {
        let base = canned_api("500 Internal Server Error", r#"{"error":"overloaded"}"#).await;
        let j = judge_at(base).score("What is DNA?", "A molecule.").await;
        assert_fallback(&j);
    }

    #[tokio::test]
    async fn empty_content_falls_back() {
        let base = canned_api("200 OK", r#"{"content":[]}"#).await;
        let j = judge_at(base).score("What is DNA?", "A molecule.").await;
        assert_fallback(&j);
    }

    #[tokio::test]
    async fn malformed_body_falls_back() {
        let base = canned_api("200 OK", "<html>gateway</html>").await;
        let j = judge_at(base).score("What is DNA?", "A molecule.").await;
        assert_fallback(&j);
    }

    #[tokio::test]
    async fn builds_configured_judge() {
        assert!(build_judge(&JudgeConfig::default()).unwrap().is_none());

        let fixed = JudgeConfig {
            kind: JudgeKind::Fixed,
            ..JudgeConfig::default()
        };
        let judge = build_judge(&fixed).unwrap().unwrap();
        assert_eq!(judge.score("p", "r").await.score(), 8);

        let keyless = JudgeConfig {
            kind: JudgeKind::Anthropic,
            ..JudgeConfig::default()
        };
        assert!(build_judge(&keyless).is_err());
    }
}
