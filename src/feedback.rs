//! Feedback aggregation
//!
//! Produces the single `feedback` event of a session. Analysis runs
//! concurrently with test execution and never sees test results.
//! - [`RemoteAnalyzer`]: AI analysis service over HTTP
//! - [`RuleBasedAnalyzer`]: deterministic heuristics, used as fallback

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::languages::Language;
use crate::protocol::Feedback;

/// Input for one analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub code: String,
    pub language: Language,
    pub problem_statement: String,
}

#[async_trait]
pub trait FeedbackAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Feedback>;
}

/// Client for the AI analysis service
pub struct RemoteAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteAnalyzer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FeedbackAnalyzer for RemoteAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Feedback> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Analysis request to {} failed", self.endpoint))?
            .error_for_status()?;

        let body = response.text().await?;
        parse_feedback(&body)
    }
}

/// Feedback as loosely produced by a model: fractional scores, `score` alias
#[derive(Debug, Deserialize)]
struct RawFeedback {
    #[serde(alias = "score")]
    overall_score: f64,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default)]
    best_practices: Vec<String>,
    #[serde(default)]
    complexity_analysis: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

impl From<RawFeedback> for Feedback {
    fn from(raw: RawFeedback) -> Self {
        let score = if raw.overall_score.is_finite() {
            raw.overall_score.round().clamp(0.0, 100.0) as u32
        } else {
            0
        };
        Feedback {
            overall_score: score,
            strengths: raw.strengths,
            improvements: raw.improvements,
            best_practices: raw.best_practices,
            complexity_analysis: raw.complexity_analysis,
            hint: raw.hint,
        }
    }
}

/// Parse a JSON body, or the outermost JSON object embedded in free text
pub fn parse_feedback(body: &str) -> Result<Feedback> {
    if let Ok(raw) = serde_json::from_str::<RawFeedback>(body) {
        return Ok(raw.into());
    }

    let start = body.find('{');
    let end = body.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            let raw: RawFeedback = serde_json::from_str(&body[start..=end])
                .context("Embedded feedback object is not valid")?;
            Ok(raw.into())
        }
        _ => anyhow::bail!("No feedback object in analysis response"),
    }
}

/// Heuristic analysis that needs no external service
#[derive(Debug, Default, Clone)]
pub struct RuleBasedAnalyzer;

impl RuleBasedAnalyzer {
    pub fn evaluate(&self, request: &AnalysisRequest) -> Feedback {
        let code = &request.code;
        let lines: Vec<&str> = code.lines().collect();
        let non_empty: Vec<&str> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();

        let mut score: i32 = 60;
        let mut strengths = Vec::new();
        let mut improvements = Vec::new();
        let mut best_practices = Vec::new();

        if non_empty.len() > 10 {
            strengths.push("Well-structured code".to_string());
            score += 5;
        }

        let has_functions = non_empty.iter().any(|l| {
            ["def ", "function ", "fn ", "func ", "class "]
                .iter()
                .any(|kw| l.starts_with(kw) || l.contains(&format!(" {}", kw)))
        });
        if has_functions {
            strengths.push("Logic is split into functions".to_string());
            score += 10;
        }

        let comment_prefix = match request.language {
            Language::Python => "#",
            _ => "//",
        };
        let comments = non_empty
            .iter()
            .filter(|l| l.starts_with(comment_prefix))
            .count();
        if has_functions && comments == 0 {
            improvements.push("Consider adding comments or doc comments".to_string());
        }

        if code.contains("TODO") || code.contains("FIXME") {
            improvements.push("There are pending TODO/FIXME markers in the code".to_string());
            score -= 10;
        }

        match request.language {
            Language::Python => {
                if code.matches("print").count() > 3 {
                    improvements
                        .push("Consider logging instead of many print calls".to_string());
                }
            }
            Language::Javascript | Language::Typescript => {
                if code.contains("var ") {
                    improvements.push("Use const/let instead of var".to_string());
                    score -= 5;
                }
                if code.contains("console.log") {
                    best_practices.push("Remove console.log calls before submitting".to_string());
                }
            }
            Language::Java => {
                if code.contains("catch (Exception") {
                    best_practices.push("Catch specific exception types".to_string());
                }
            }
            _ => {}
        }

        if strengths.is_empty() {
            strengths.push("Code submitted for evaluation".to_string());
        }
        if improvements.is_empty() {
            improvements.push("Keep practicing!".to_string());
        }

        Feedback {
            overall_score: score.clamp(0, 100) as u32,
            strengths,
            improvements,
            best_practices,
            complexity_analysis: Some("Basic heuristic analysis".to_string()),
            hint: Some("Test your solution with edge cases such as empty or very large input.".to_string()),
        }
    }
}

#[async_trait]
impl FeedbackAnalyzer for RuleBasedAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Feedback> {
        Ok(self.evaluate(request))
    }
}

/// Chooses the analyzer for a session and guarantees at most one feedback
pub struct FeedbackAggregator {
    primary: Option<Arc<dyn FeedbackAnalyzer>>,
    fallback: RuleBasedAnalyzer,
}

impl FeedbackAggregator {
    pub fn new(primary: Option<Arc<dyn FeedbackAnalyzer>>) -> Self {
        Self {
            primary,
            fallback: RuleBasedAnalyzer,
        }
    }

    /// Rule-based feedback only
    pub fn rule_based() -> Self {
        Self::new(None)
    }

    pub async fn produce(&self, request: &AnalysisRequest) -> Option<Feedback> {
        if let Some(primary) = &self.primary {
            match primary.analyze(request).await {
                Ok(feedback) => return Some(feedback),
                Err(e) => warn!("AI analysis failed, using rule-based feedback: {:#}", e),
            }
        }

        debug!("Producing rule-based feedback for {} code", request.language);
        self.fallback.analyze(request).await.ok()
    }
}
