use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::classifier::extract_root_cause;
use crate::error::ResponderError;
use crate::incident::{DiagnosisResult, LogEntry, MetricSeries};
use crate::ports::{ReasoningRequest, ReasoningService};
use crate::tool_loop::{ToolLoop, ToolLoopOutcome, Turn};
use crate::tools::ToolRegistry;

/// Confidence reported when the reasoning service gives none. A fixed
/// placeholder, not derived from the model.
pub const DEFAULT_CONFIDENCE: f64 = 0.85;

const PREAMBLE: &str = "You are an SRE diagnosing a misconfigured AWS Lambda function. \
Answer with the root cause on the first line, then your reasoning.";

#[derive(Clone, Debug)]
pub struct DiagnosisSettings {
    pub temperature: f64,
    pub max_tokens: u64,
    /// Log lines included in the prompt.
    pub log_line_cap: usize,
    pub max_iterations: usize,
}

impl Default for DiagnosisSettings {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
            log_line_cap: 10,
            max_iterations: crate::tool_loop::DEFAULT_MAX_ITERATIONS,
        }
    }
}

pub struct DiagnosisInput<'a> {
    pub resource_id: &'a str,
    pub description: &'a str,
    pub metrics: &'a [MetricSeries],
    pub logs: &'a [LogEntry],
}

#[derive(Clone, Debug)]
pub struct Diagnosis {
    pub result: DiagnosisResult,
    /// Present when the tool-calling loop drove the diagnosis.
    pub tool_loop: Option<ToolLoopOutcome>,
}

pub struct DiagnosisRequester {
    reasoning: Arc<dyn ReasoningService>,
    settings: DiagnosisSettings,
}

#[derive(Serialize)]
struct MetricSummary<'a> {
    name: &'a str,
    points: usize,
    sum: f64,
    max: Option<f64>,
    latest: Option<f64>,
}

impl DiagnosisRequester {
    pub fn new(reasoning: Arc<dyn ReasoningService>, settings: DiagnosisSettings) -> Self {
        Self {
            reasoning,
            settings,
        }
    }

    /// Asks the reasoning service for a root cause. With `tools`, the
    /// service may call them through the tool-calling loop first; without,
    /// it is a single request/response.
    pub async fn diagnose(
        &self,
        input: &DiagnosisInput<'_>,
        tools: Option<&ToolRegistry>,
    ) -> Result<Diagnosis, ResponderError> {
        let prompt = self.build_prompt(input);

        let (text, confidence, tool_loop) = match tools.filter(|t| !t.is_empty()) {
            Some(registry) => {
                let outcome = ToolLoop::new(self.reasoning.as_ref(), registry)
                    .max_iterations(self.settings.max_iterations)
                    .temperature(self.settings.temperature)
                    .max_tokens(self.settings.max_tokens)
                    .preamble(PREAMBLE)
                    .run(prompt)
                    .await
                    .map_err(ResponderError::DiagnosisFailed)?;
                (outcome.answer.clone(), outcome.confidence, Some(outcome))
            }
            None => {
                let request = ReasoningRequest {
                    preamble: Some(PREAMBLE.into()),
                    conversation: vec![Turn::user_text(prompt)],
                    tools: Vec::new(),
                    temperature: self.settings.temperature,
                    max_tokens: self.settings.max_tokens,
                };
                let response = self
                    .reasoning
                    .respond(&request)
                    .await
                    .map_err(ResponderError::DiagnosisFailed)?;
                (response.text.unwrap_or_default(), response.confidence, None)
            }
        };

        let confidence = confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_CONFIDENCE);

        Ok(Diagnosis {
            result: DiagnosisResult {
                root_cause: extract_root_cause(&text),
                confidence,
                affected_components: affected_components(input.resource_id),
                reasoning: text,
                created_at: Utc::now(),
            },
            tool_loop,
        })
    }

    fn build_prompt(&self, input: &DiagnosisInput<'_>) -> String {
        let summaries: Vec<MetricSummary<'_>> = input
            .metrics
            .iter()
            .map(|series| MetricSummary {
                name: &series.name,
                points: series.points.len(),
                sum: series.sum(),
                max: series
                    .points
                    .iter()
                    .map(|p| p.value)
                    .reduce(f64::max),
                latest: series.points.last().map(|p| p.value),
            })
            .collect();
        let metrics_json =
            serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".into());

        let logs = input
            .logs
            .iter()
            .take(self.settings.log_line_cap)
            .map(|entry| entry.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Incident: {}\nFunction: {}\n\nMetrics summary:\n{}\n\nRecent logs:\n{}",
            input.description,
            input.resource_id,
            metrics_json,
            if logs.is_empty() { "(none)" } else { logs.as_str() },
        )
    }
}

fn affected_components(resource_id: &str) -> Vec<String> {
    if resource_id.is_empty() {
        Vec::new()
    } else {
        vec![resource_id.to_string()]
    }
}
