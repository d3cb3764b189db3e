use async_trait::async_trait;
use rig::client::{completion::CompletionClient, ProviderClient};
use rig::completion::{AssistantContent, CompletionModel, Message, ToolDefinition as RigTool};
use rig::message::{ToolResultContent, UserContent};
use rig::providers::openai;
use rig::OneOrMany;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ServiceError;
use crate::ports::{ReasoningRequest, ReasoningResponse, ReasoningService, ToolInvocation};
use crate::tool_loop::{Role, Turn, TurnContent};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn api_key_present(&self) -> bool {
        std::env::var(&self.api_key_env).is_ok()
    }
}

/// [`ReasoningService`] over a rig completion model.
pub struct RigReasoningService<M> {
    model: M,
}

impl<M> RigReasoningService<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

/// Builds the configured provider's reasoning service.
pub fn reasoning_from_config(config: &LlmConfig) -> Result<Arc<dyn ReasoningService>, ServiceError> {
    if config.provider.to_lowercase() != "openai" {
        return Err(ServiceError::Unavailable(format!(
            "unsupported llm provider '{}'",
            config.provider
        )));
    }

    let client = if config.api_key_env == "OPENAI_API_KEY" && config.api_key_present() {
        openai::Client::from_env()
    } else {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| ServiceError::Unavailable(format!("missing env var {}", config.api_key_env)))?;
        openai::Client::new(&api_key)
            .map_err(|e| ServiceError::Unavailable(format!("openai client error: {e}")))?
    };

    Ok(Arc::new(RigReasoningService::new(
        client.completion_model(&config.model),
    )))
}

#[async_trait]
impl<M> ReasoningService for RigReasoningService<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn respond(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
        let mut history = request
            .conversation
            .iter()
            .map(to_message)
            .collect::<Result<Vec<_>, _>>()?;
        let Some(prompt) = history.pop() else {
            return Err(ServiceError::Rejected("empty conversation".into()));
        };

        let tools = request
            .tools
            .iter()
            .map(|t| RigTool {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect::<Vec<_>>();

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .tools(tools)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens);
        if let Some(preamble) = &request.preamble {
            builder = builder.preamble(preamble.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("llm completion failed: {e}")))?;

        let mut texts = Vec::new();
        let mut tool_invocations = Vec::new();
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(text) => texts.push(text.text.clone()),
                AssistantContent::ToolCall(call) => tool_invocations.push(ToolInvocation {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input: call.function.arguments.clone(),
                }),
                _ => {}
            }
        }

        Ok(ReasoningResponse {
            text: (!texts.is_empty()).then(|| texts.join("\n")),
            tool_invocations,
            confidence: None,
        })
    }
}

fn to_message(turn: &Turn) -> Result<Message, ServiceError> {
    let empty = |what: &str| ServiceError::Rejected(format!("{what} turn without content"));
    Ok(match (&turn.role, &turn.content) {
        (Role::User, TurnContent::Text { text }) => Message::user(text.clone()),
        (Role::Assistant, TurnContent::Text { text }) => Message::assistant(text.clone()),
        (_, TurnContent::ToolRequests { text, invocations }) => {
            let mut content = Vec::new();
            if let Some(text) = text {
                content.push(AssistantContent::text(text.clone()));
            }
            content.extend(invocations.iter().map(|inv| {
                AssistantContent::tool_call(inv.id.clone(), inv.name.clone(), inv.input.clone())
            }));
            Message::Assistant {
                id: None,
                content: OneOrMany::many(content).map_err(|_| empty("tool request"))?,
            }
        }
        (_, TurnContent::ToolResults { results }) => {
            let content = results
                .iter()
                .map(|r| {
                    let body = match &r.output {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    UserContent::tool_result(
                        r.invocation_id.clone(),
                        OneOrMany::one(ToolResultContent::text(body)),
                    )
                })
                .collect::<Vec<_>>();
            Message::User {
                content: OneOrMany::many(content).map_err(|_| empty("tool result"))?,
            }
        }
    })
}
