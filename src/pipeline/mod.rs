//! Request pipeline entry point (spec.md §4.1, §4.2).
//!
//! Wires admission (`ParkingGate`) to the FIFO `QueueWorker` and, for
//! non-streaming requests, drains the resulting interceptor stream into a
//! finished response. Streaming requests get the raw stream handed back
//! so the HTTP layer can frame it as SSE while still driving it through
//! the same disconnect/silence machinery.

pub mod disconnect;
pub mod parking_gate;
pub mod queue_worker;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::capability::InterceptorStream;
use crate::domain::{ChatCompletionRequest, ChatCompletionResponse};
use crate::error::GatewayError;
use crate::response;
use crate::runtime_state::SharedRuntimeState;

use disconnect::CompletionEvent;
use parking_gate::ParkingGate;
use queue_worker::{QueueItem, QueueOutcome};

pub enum SubmitOutcome {
    NonStreaming(ChatCompletionResponse),
    Streaming {
        stream: Box<dyn InterceptorStream>,
        completion: Arc<CompletionEvent>,
        silence_threshold: Duration,
        model: String,
        req_id: String,
    },
    ToolCall { function_name: String, result: serde_json::Value },
}

pub struct RequestPipeline {
    gate: ParkingGate,
    sender: mpsc::Sender<QueueItem>,
    completion_timeout_secs: f64,
}

impl RequestPipeline {
    pub fn new(state: SharedRuntimeState, sender: mpsc::Sender<QueueItem>, completion_timeout_secs: f64) -> Self {
        Self { gate: ParkingGate::new(state), sender, completion_timeout_secs }
    }

    /// Request-shape validation (spec.md §4.1 step 1): at least one
    /// message, and the latest user message must carry non-empty text
    /// unless a pinned local tool will drive execution instead.
    pub fn validate(request: &ChatCompletionRequest) -> Result<(), GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::BadRequest("messages must not be empty".to_string()));
        }
        let drives_local_tool = tools::resolve_local_function(request).is_some();
        if !request.has_latest_user_text() && !drives_local_tool {
            return Err(GatewayError::BadRequest("the latest user message must have non-empty text".to_string()));
        }
        Ok(())
    }

    pub async fn submit(
        &self,
        req_id: String,
        request: ChatCompletionRequest,
        is_alive: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Result<SubmitOutcome, GatewayError> {
        Self::validate(&request)?;
        self.gate.wait().await?;

        let streaming = request.stream;
        let model = request.model.clone().unwrap_or_else(|| "default".to_string());
        let prompt_len: usize = request.messages.iter().map(|m| m.content.as_text().len()).sum();

        let (tx, rx) = oneshot::channel();
        let item = QueueItem { req_id: req_id.clone(), request, is_alive, result_tx: tx };
        self.sender
            .send(item)
            .await
            .map_err(|_| GatewayError::InternalError("queue worker unavailable".to_string()))?;

        let outcome = rx
            .await
            .map_err(|_| GatewayError::InternalError("queue worker dropped the request".to_string()))??;

        match outcome {
            QueueOutcome::ToolCall { function_name, result } => Ok(SubmitOutcome::ToolCall { function_name, result }),
            QueueOutcome::Streamed { stream, completion } => {
                if streaming {
                    let silence_threshold = self.silence_threshold(prompt_len);
                    Ok(SubmitOutcome::Streaming { stream, completion, silence_threshold, model, req_id })
                } else {
                    self.drain_non_streaming(req_id, model, stream, completion).await
                }
            }
        }
    }

    async fn drain_non_streaming(
        &self,
        req_id: String,
        model: String,
        mut stream: Box<dyn InterceptorStream>,
        completion: Arc<CompletionEvent>,
        // silence detection is disabled for non-streaming requests (spec.md §4.4)
    ) -> Result<SubmitOutcome, GatewayError> {
        let created = chrono::Utc::now().timestamp();
        match response::drain(stream.as_mut(), &completion, None).await {
            response::DrainOutcome::Done(output) => {
                let usage = response::estimate_tokens("", &output.consolidated_text());
                let resp = response::build_non_streaming_response(&req_id, &model, created, &output, usage);
                Ok(SubmitOutcome::NonStreaming(resp))
            }
            response::DrainOutcome::UpstreamError(msg) => Err(GatewayError::UpstreamPlaywright(msg)),
            response::DrainOutcome::SilenceTimeout => Err(GatewayError::ResponseTimeout),
            response::DrainOutcome::Disconnected => Err(GatewayError::ClientDisconnected),
        }
    }

    /// Dynamic response timeout (spec.md §4.1 step 7): `max(5 +
    /// prompt_len/1000, configured_timeout)` seconds overall, with the
    /// silence-detection threshold set to half that (floored at 60s).
    fn silence_threshold(&self, prompt_len: usize) -> Duration {
        let dynamic = 5.0 + (prompt_len as f64) / 1000.0;
        let timeout = dynamic.max(self.completion_timeout_secs);
        let silence = (timeout / 2.0).max(60.0);
        Duration::from_secs_f64(silence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMessage, Content, Role};

    fn request_with(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: None,
            messages,
            stream: false,
            tools: None,
            tool_choice: None,
            seed: None,
            response_format: None,
            stop: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            thinking_level: None,
        }
    }

    #[test]
    fn rejects_empty_messages() {
        let req = request_with(vec![]);
        assert!(matches!(RequestPipeline::validate(&req), Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn rejects_blank_latest_user_text_without_a_pinned_tool() {
        let req = request_with(vec![ChatMessage { role: Role::User, content: Content::Text("   ".to_string()) }]);
        assert!(matches!(RequestPipeline::validate(&req), Err(GatewayError::BadRequest(_))));
    }

    #[test]
    fn accepts_non_empty_latest_user_text() {
        let req = request_with(vec![ChatMessage { role: Role::User, content: Content::Text("hi".to_string()) }]);
        assert!(RequestPipeline::validate(&req).is_ok());
    }

    #[test]
    fn silence_threshold_is_half_the_dynamic_timeout_floored_at_60s() {
        let state = crate::runtime_state::RuntimeState::shared();
        let (_worker_sender, _worker_receiver) = tokio::sync::mpsc::channel(1);
        let pipeline = RequestPipeline::new(state, _worker_sender, 300.0);
        assert_eq!(pipeline.silence_threshold(0), Duration::from_secs_f64(150.0));
        assert_eq!(pipeline.silence_threshold(200_000), Duration::from_secs_f64(150.0));
    }
}
