//! Bounded conversation with the reasoning service in which it may request
//! diagnostic tool calls before giving its final answer.

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::ports::{ReasoningRequest, ReasoningService, ToolInvocation};
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub invocation_id: String,
    pub output: serde_json::Value,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(invocation_id: &str, output: serde_json::Value) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            output,
            is_error: false,
        }
    }

    pub fn error(invocation_id: &str, message: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            output: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text {
        text: String,
    },
    ToolRequests {
        text: Option<String>,
        invocations: Vec<ToolInvocation>,
    },
    ToolResults {
        results: Vec<ToolOutput>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text { text: text.into() },
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text { text: text.into() },
        }
    }

    /// Free text carried by the turn, if any.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            TurnContent::ToolRequests { text, .. } => text.as_deref(),
            TurnContent::ToolResults { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolLoopOutcome {
    /// Final answer, or the last assistant text when the budget ran out.
    pub answer: String,
    pub conversation: Vec<Turn>,
    /// Reasoning-service calls made.
    pub iterations: usize,
    pub tool_calls: usize,
    pub exhausted: bool,
    pub confidence: Option<f64>,
}

pub struct ToolLoop<'a> {
    reasoning: &'a dyn ReasoningService,
    registry: &'a ToolRegistry,
    max_iterations: usize,
    temperature: f64,
    max_tokens: u64,
    preamble: Option<String>,
}

impl<'a> ToolLoop<'a> {
    pub fn new(reasoning: &'a dyn ReasoningService, registry: &'a ToolRegistry) -> Self {
        Self {
            reasoning,
            registry,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: 0.2,
            max_tokens: 1024,
            preamble: None,
        }
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    /// Drives the conversation until the service answers without tool
    /// requests or `max_iterations` calls have been made. Running out of
    /// iterations is not an error; the outcome is marked `exhausted`.
    pub async fn run(&self, prompt: impl Into<String>) -> Result<ToolLoopOutcome, ServiceError> {
        let mut conversation = vec![Turn::user_text(prompt)];
        let tools = self.registry.definitions();
        let mut tool_calls = 0;
        let mut confidence = None;

        for iteration in 1..=self.max_iterations {
            let request = ReasoningRequest {
                preamble: self.preamble.clone(),
                conversation: conversation.clone(),
                tools: tools.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };
            let response = self.reasoning.respond(&request).await?;
            confidence = response.confidence.or(confidence);

            if response.tool_invocations.is_empty() {
                let answer = response.text.unwrap_or_default();
                conversation.push(Turn::assistant_text(answer.clone()));
                return Ok(ToolLoopOutcome {
                    answer,
                    conversation,
                    iterations: iteration,
                    tool_calls,
                    exhausted: false,
                    confidence,
                });
            }

            // Invocations within one turn are independent reads.
            let results = join_all(
                response
                    .tool_invocations
                    .iter()
                    .map(|invocation| self.registry.execute(invocation)),
            )
            .await;
            tool_calls += results.len();
            tracing::debug!(iteration, requested = results.len(), "tool results collected");

            conversation.push(Turn {
                role: Role::Assistant,
                content: TurnContent::ToolRequests {
                    text: response.text,
                    invocations: response.tool_invocations,
                },
            });
            conversation.push(Turn {
                role: Role::User,
                content: TurnContent::ToolResults { results },
            });
        }

        tracing::warn!(
            max_iterations = self.max_iterations,
            "tool loop exhausted its iteration budget"
        );
        let answer = conversation
            .iter()
            .rev()
            .filter(|turn| turn.role == Role::Assistant)
            .find_map(Turn::text)
            .unwrap_or_default()
            .to_string();
        Ok(ToolLoopOutcome {
            answer,
            conversation,
            iterations: self.max_iterations,
            tool_calls,
            exhausted: true,
            confidence,
        })
    }
}
