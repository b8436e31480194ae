//! Queue worker (spec.md §4.1, §5).
//!
//! Serializes all browser access behind a single FIFO: one submission is
//! in flight against the page at a time. Up to [`MAX_HEAD_OF_QUEUE_PRUNE`]
//! already-disconnected items at the head of the queue are dropped before
//! ever reaching the page, so a burst of abandoned requests doesn't stall
//! the worker behind dead connections.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::capability::{
    CancelCheck, Clock, InterceptorStream, ModelListEntry, PageController, ResponseCapture, SubmitAttachment, UiParams,
};
use crate::domain::{ChatCompletionRequest, Content, ContentPart, Role};
use crate::error::GatewayError;
use crate::pipeline::disconnect::{self, CompletionEvent};
use crate::pipeline::tools::{self, ToolExecutor};
use crate::quota::QuotaMonitor;
use crate::rotation::RotationCoordinator;
use crate::runtime_state::SharedRuntimeState;

const MAX_HEAD_OF_QUEUE_PRUNE: usize = 10;

/// What processing a queued request resolves to. Streaming and
/// non-streaming callers both get the raw interceptor stream back;
/// response assembly (and SSE framing, for streaming) happens above this
/// layer so the worker itself never blocks on draining a response.
pub enum QueueOutcome {
    Streamed { stream: Box<dyn InterceptorStream>, completion: Arc<CompletionEvent> },
    ToolCall { function_name: String, result: serde_json::Value },
}

pub struct QueueItem {
    pub req_id: String,
    pub request: ChatCompletionRequest,
    pub is_alive: Arc<dyn Fn() -> bool + Send + Sync>,
    pub result_tx: oneshot::Sender<Result<QueueOutcome, GatewayError>>,
}

pub struct QueueWorker {
    receiver: Mutex<mpsc::Receiver<QueueItem>>,
    page: Arc<dyn PageController>,
    capture: Arc<dyn ResponseCapture>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    rotation: Arc<RotationCoordinator>,
    quota: Arc<QuotaMonitor>,
    clock: Arc<dyn Clock>,
    state: SharedRuntimeState,
    model_list: Vec<ModelListEntry>,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        page: Arc<dyn PageController>,
        capture: Arc<dyn ResponseCapture>,
        tool_executor: Option<Arc<dyn ToolExecutor>>,
        rotation: Arc<RotationCoordinator>,
        quota: Arc<QuotaMonitor>,
        clock: Arc<dyn Clock>,
        state: SharedRuntimeState,
        model_list: Vec<ModelListEntry>,
    ) -> (Self, mpsc::Sender<QueueItem>) {
        let (sender, receiver) = mpsc::channel(256);
        let worker = Self {
            receiver: Mutex::new(receiver),
            page,
            capture,
            tool_executor,
            rotation,
            quota,
            clock,
            state,
            model_list,
        };
        (worker, sender)
    }

    /// Runs until the channel closes or shutdown is flagged. Meant to be
    /// spawned once for the lifetime of the process.
    pub async fn run(&self) {
        let mut receiver = self.receiver.lock().await;
        loop {
            if self.state.is_shutting_down.load(Ordering::SeqCst) {
                tracing::info!("queue worker exiting, shutdown in progress");
                return;
            }

            let mut pruned = 0usize;
            let item = loop {
                match receiver.recv().await {
                    Some(item) => {
                        if !(item.is_alive)() && pruned < MAX_HEAD_OF_QUEUE_PRUNE {
                            pruned += 1;
                            tracing::debug!(req_id = %item.req_id, "pruning disconnected item at head of queue");
                            let _ = item.result_tx.send(Err(GatewayError::ClientDisconnected));
                            continue;
                        }
                        break Some(item);
                    }
                    None => break None,
                }
            };

            let Some(item) = item else {
                return;
            };
            self.process(item).await;
        }
    }

    async fn process(&self, item: QueueItem) {
        let req_id = item.req_id.clone();
        let result = self.process_inner(&item).await;
        if result.is_err() {
            tracing::warn!(req_id = %req_id, ?result, "queued request failed");
        }
        let _ = item.result_tx.send(result);
    }

    async fn process_inner(&self, item: &QueueItem) -> Result<QueueOutcome, GatewayError> {
        if !(item.is_alive)() {
            return Err(GatewayError::ClientDisconnected);
        }

        if let Some(function_name) = tools::resolve_local_function(&item.request) {
            if let Some(executor) = &self.tool_executor {
                let args = tools::extract_arguments(&item.request);
                let cancel_check = cancel_check_from(&item.is_alive);
                let result = executor.execute(&function_name, &args, cancel_check).await?;
                return Ok(QueueOutcome::ToolCall { function_name, result });
            }
        }

        if !self.page.is_ready().await {
            return Err(GatewayError::PageNotReady);
        }

        if self.quota.needs_rotation() {
            let queued = self.state.queued_request_count.load(Ordering::SeqCst);
            let model = item.request.model.clone();
            if let Err(err) = self.rotation.perform(model.as_deref(), self.page.as_ref(), queued, self.clock.as_ref()).await {
                tracing::warn!(?err, "pending rotation attempt failed, continuing with current profile");
            }
        }

        if let Some(model_id) = &item.request.model {
            let already_active = self.state.current_model_id.read().await.as_deref() == Some(model_id.as_str());
            if !already_active {
                self.page
                    .switch_model(model_id)
                    .await
                    .map_err(|err| GatewayError::ModelSwitchFailed(err.to_string()))?;
                *self.state.current_model_id.write().await = Some(model_id.clone());
            }
        }

        let cancel_check = cancel_check_from(&item.is_alive);
        self.page
            .adjust_parameters(&ui_params(&item.request), item.request.model.as_deref().unwrap_or("default"), &self.model_list, cancel_check.clone())
            .await?;

        let prompt = tools::latest_user_text(&item.request.messages).unwrap_or_default();
        let attachments = collect_attachments(&item.request);
        self.page.submit(&prompt, &attachments, cancel_check).await?;

        let stream = self.capture.open_stream(&item.req_id).await;
        let completion = Arc::new(CompletionEvent::default());

        let monitor_page = self.page.clone();
        let monitor_completion = completion.clone();
        let alive = item.is_alive.clone();
        let streaming = item.request.stream;
        tokio::spawn(async move {
            let disconnected = disconnect::monitor(move || alive(), monitor_completion, streaming).await;
            if disconnected {
                let _ = monitor_page.stop_generation().await;
            }
        });

        Ok(QueueOutcome::Streamed { stream, completion })
    }
}

fn cancel_check_from(is_alive: &Arc<dyn Fn() -> bool + Send + Sync>) -> CancelCheck {
    let alive = is_alive.clone();
    Arc::new(move || !alive())
}

fn ui_params(request: &ChatCompletionRequest) -> UiParams {
    serde_json::json!({
        "temperature": request.temperature,
        "top_p": request.top_p,
        "max_tokens": request.max_tokens,
        "thinking_level": request.thinking_level,
    })
}

fn collect_attachments(request: &ChatCompletionRequest) -> Vec<SubmitAttachment> {
    request
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| match &m.content {
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(SubmitAttachment { uri: image_url.url.clone() }),
                    ContentPart::AttachmentRef { attachment_ref } => Some(SubmitAttachment { uri: attachment_ref.clone() }),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
            Content::Text(_) => vec![],
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InterceptorEvent;
    use crate::domain::Role as DomainRole;
    use crate::quota::QuotaLimits;
    use crate::rotation::RotationConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct FakePage;
    #[async_trait]
    impl PageController for FakePage {
        async fn is_ready(&self) -> bool {
            true
        }
        async fn submit(&self, _: &str, _: &[SubmitAttachment], _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn adjust_parameters(&self, _: &UiParams, _: &str, _: &[ModelListEntry], _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn switch_model(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn apply_auth_profile(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn clear_chat_history(&self, _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn stop_generation(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn save_cookies(&self, _: &str) -> Result<bool, GatewayError> {
            Ok(true)
        }
    }

    struct ImmediateDoneStream;
    #[async_trait]
    impl InterceptorStream for ImmediateDoneStream {
        async fn next_event(&mut self) -> Option<InterceptorEvent> {
            Some(InterceptorEvent::Done)
        }
    }

    struct FakeCapture;
    #[async_trait]
    impl ResponseCapture for FakeCapture {
        async fn open_stream(&self, _: &str) -> Box<dyn InterceptorStream> {
            Box::new(ImmediateDoneStream)
        }
    }

    struct FakeClock;
    #[async_trait]
    impl Clock for FakeClock {
        fn now_unix(&self) -> i64 {
            1_700_000_000
        }
        async fn sleep(&self, _: Duration) {}
    }

    fn make_request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("gemini-pro".to_string()),
            messages: vec![crate::domain::ChatMessage { role: DomainRole::User, content: Content::Text("hello".to_string()) }],
            stream,
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

    fn build_worker() -> (QueueWorker, mpsc::Sender<QueueItem>) {
        let state = crate::runtime_state::RuntimeState::shared();
        let rotation = Arc::new(RotationCoordinator::new(RotationConfig { auto_rotate: false, ..RotationConfig::default() }, state.clone()));
        let quota = Arc::new(QuotaMonitor::new(state.clone(), QuotaLimits::default()));
        QueueWorker::new(Arc::new(FakePage), Arc::new(FakeCapture), None, rotation, quota, Arc::new(FakeClock), state, vec![])
    }

    #[tokio::test]
    async fn processes_item_and_returns_streamed_outcome() {
        let (worker, sender) = build_worker();
        let worker = Arc::new(worker);
        let run_handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        let (tx, rx) = oneshot::channel();
        let item = QueueItem { req_id: "r1".into(), request: make_request(false), is_alive: Arc::new(|| true), result_tx: tx };
        sender.send(item).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(result, Ok(QueueOutcome::Streamed { .. })));

        run_handle.abort();
    }

    #[tokio::test]
    async fn prunes_disconnected_head_of_queue_items() {
        let (worker, sender) = build_worker();
        let worker = Arc::new(worker);
        let run_handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        let dead = Arc::new(AtomicBool::new(false));
        let (dead_tx, dead_rx) = oneshot::channel();
        sender
            .send(QueueItem {
                req_id: "dead".into(),
                request: make_request(false),
                is_alive: { let dead = dead.clone(); Arc::new(move || dead.load(Ordering::SeqCst)) },
                result_tx: dead_tx,
            })
            .await
            .unwrap();

        let (live_tx, live_rx) = oneshot::channel();
        sender
            .send(QueueItem { req_id: "live".into(), request: make_request(false), is_alive: Arc::new(|| true), result_tx: live_tx })
            .await
            .unwrap();

        let dead_result = tokio::time::timeout(Duration::from_secs(2), dead_rx).await.unwrap().unwrap();
        assert!(matches!(dead_result, Err(GatewayError::ClientDisconnected)));

        let live_result = tokio::time::timeout(Duration::from_secs(2), live_rx).await.unwrap().unwrap();
        assert!(matches!(live_result, Ok(QueueOutcome::Streamed { .. })));

        run_handle.abort();
    }
}
