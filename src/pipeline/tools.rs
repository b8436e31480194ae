//! Local tool execution (spec.md §4.1.1).
//!
//! When the resolved `tool_choice` pins a single function, the pipeline
//! can short-circuit the browser entirely: pull an argument object out
//! of the newest user message, dispatch it to a registered handler
//! in-process or over HTTP to an MCP endpoint, and hand back a
//! `tool_calls` response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::CancelCheck;
use crate::domain::{ChatCompletionRequest, ChatMessage, Role, ToolChoice, ToolChoiceMode};
use crate::error::GatewayError;

/// Decides, per spec.md §4.1 step 4, whether a single local function is
/// pinned by the request: an explicit named choice, or `auto`/`required`
/// with exactly one declared tool.
pub fn resolve_local_function(req: &ChatCompletionRequest) -> Option<String> {
    match req.tool_choice.as_ref()? {
        ToolChoice::Named { function } => Some(function.name.clone()),
        ToolChoice::Mode(ToolChoiceMode::None) => None,
        ToolChoice::Mode(ToolChoiceMode::Auto) | ToolChoice::Mode(ToolChoiceMode::Required) => {
            let tools = req.tools.as_ref()?;
            if tools.len() == 1 {
                Some(tools[0].function.name.clone())
            } else {
                None
            }
        }
    }
}

pub fn latest_user_text(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| m.content.as_text())
}

/// Scans `text` for the first balanced `{...}` span that parses as JSON.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

pub fn extract_arguments(req: &ChatCompletionRequest) -> Value {
    latest_user_text(&req.messages)
        .and_then(|text| extract_json_object(&text))
        .unwrap_or_else(|| json!({}))
}

/// A dispatch target for a locally-executed tool call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value, cancel_check: CancelCheck) -> Result<Value, GatewayError>;
}

type Handler = Arc<dyn Fn(&Value) -> Result<Value, GatewayError> + Send + Sync>;

/// Dispatches to handlers registered in-process.
#[derive(Clone, Default)]
pub struct InProcessRegistry {
    handlers: HashMap<String, Handler>,
}

impl InProcessRegistry {
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) {
        self.handlers.insert(name.into(), handler);
    }
}

#[async_trait]
impl ToolExecutor for InProcessRegistry {
    async fn execute(&self, name: &str, arguments: &Value, cancel_check: CancelCheck) -> Result<Value, GatewayError> {
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| GatewayError::BadRequest(format!("no local handler registered for tool '{name}'")))?;
        handler(arguments)
    }
}

/// Dispatches over HTTP to `POST {endpoint}/tools/execute`.
pub struct McpHttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl McpHttpExecutor {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), endpoint, timeout }
    }
}

#[async_trait]
impl ToolExecutor for McpHttpExecutor {
    async fn execute(&self, name: &str, arguments: &Value, cancel_check: CancelCheck) -> Result<Value, GatewayError> {
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        let url = format!("{}/tools/execute", self.endpoint.trim_end_matches('/'));
        let request = self
            .client
            .post(&url)
            .json(&json!({ "name": name, "arguments": arguments }))
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| GatewayError::ResponseTimeout)?
            .map_err(|e| GatewayError::UpstreamPlaywright(format!("mcp dispatch failed: {e}")))?;

        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::InternalError(format!("mcp response decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FunctionDeclaration, NamedFunction, ToolDeclaration};

    #[test]
    fn extracts_first_balanced_object_ignoring_braces_in_strings() {
        let text = r#"please call with {"a": "}weird{", "b": 2} trailing junk"#;
        let parsed = extract_json_object(text).unwrap();
        assert_eq!(parsed, json!({"a": "}weird{", "b": 2}));
    }

    #[test]
    fn returns_none_when_no_object_present() {
        assert_eq!(extract_json_object("no braces here"), None);
    }

    #[test]
    fn resolves_named_tool_choice() {
        let req = ChatCompletionRequest {
            model: None,
            messages: vec![],
            stream: false,
            tools: None,
            tool_choice: Some(ToolChoice::Named { function: NamedFunction { name: "lookup".into() } }),
            seed: None,
            response_format: None,
            stop: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            thinking_level: None,
        };
        assert_eq!(resolve_local_function(&req), Some("lookup".to_string()));
    }

    #[test]
    fn resolves_auto_with_single_declared_tool() {
        let req = ChatCompletionRequest {
            model: None,
            messages: vec![],
            stream: false,
            tools: Some(vec![ToolDeclaration {
                kind: "function".into(),
                function: FunctionDeclaration { name: "only_tool".into(), description: None, parameters: None },
            }]),
            tool_choice: Some(ToolChoice::Mode(ToolChoiceMode::Auto)),
            seed: None,
            response_format: None,
            stop: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            thinking_level: None,
        };
        assert_eq!(resolve_local_function(&req), Some("only_tool".to_string()));
    }

    #[tokio::test]
    async fn in_process_registry_dispatches_registered_handler() {
        let mut registry = InProcessRegistry::default();
        registry.register("echo", Arc::new(|args: &Value| Ok(args.clone())));
        let result = registry.execute("echo", &json!({"x": 1}), Arc::new(|| false)).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn in_process_registry_propagates_cancellation() {
        let registry = InProcessRegistry::default();
        let err = registry.execute("anything", &json!({}), Arc::new(|| true)).await.unwrap_err();
        assert!(matches!(err, GatewayError::ClientCancelled));
    }
}
