//! HTTP bridge to the headless-browser driver process (spec.md §6: the
//! driver itself is out of scope, exposed only as a capability
//! interface). The driver runs as a local sidecar on `stream_port` and
//! exposes a small control surface plus a chunked byte stream per
//! request; this module is the one concrete adapter wiring
//! [`PageController`]/[`ResponseCapture`] to it over `reqwest`.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::json;

use crate::capability::{
    CancelCheck, InterceptorEvent, InterceptorStream, ModelListEntry, PageController, ResponseCapture, SubmitAttachment, UiParams,
};
use crate::error::GatewayError;
use crate::interceptor::HttpInterceptor;

pub struct HttpBridgeController {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBridgeController {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamPlaywright(format!("bridge request to {path} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamPlaywright(format!("bridge {path} returned {}", response.status())));
        }

        response
            .json::<serde_json::Value>()
            .await
            .or(Ok(serde_json::Value::Null))
    }

    /// Fetches the driver's current model list (`GET /models`), used to
    /// populate `GET /v1/models` and the `model_list` passed into
    /// `adjust_parameters`.
    pub async fn fetch_model_list(&self) -> Result<Vec<ModelListEntry>, GatewayError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamPlaywright(format!("bridge /models request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamPlaywright(format!("bridge /models returned {}", response.status())));
        }

        #[derive(serde::Deserialize)]
        struct RawEntry {
            id: String,
            #[serde(default)]
            display_name: Option<String>,
        }

        let raw: Vec<RawEntry> = response
            .json()
            .await
            .map_err(|e| GatewayError::InternalError(format!("bridge /models decode failed: {e}")))?;

        Ok(raw
            .into_iter()
            .map(|r| ModelListEntry { display_name: r.display_name.unwrap_or_else(|| r.id.clone()), id: r.id })
            .collect())
    }
}

#[async_trait]
impl PageController for HttpBridgeController {
    async fn is_ready(&self) -> bool {
        let url = format!("{}/ready", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    async fn submit(&self, prompt: &str, attachments: &[SubmitAttachment], cancel_check: CancelCheck) -> Result<(), GatewayError> {
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        let body = json!({
            "prompt": prompt,
            "attachments": attachments.iter().map(|a| a.uri.clone()).collect::<Vec<_>>(),
        });
        let result = self.post_json("/submit", body).await.map(|_| ());
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        result
    }

    async fn adjust_parameters(&self, params: &UiParams, model_id: &str, model_list: &[ModelListEntry], cancel_check: CancelCheck) -> Result<(), GatewayError> {
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        let body = json!({
            "params": params,
            "model_id": model_id,
            "model_list": model_list.iter().map(|m| json!({"id": m.id, "display_name": m.display_name})).collect::<Vec<_>>(),
        });
        self.post_json("/parameters", body).await.map(|_| ())
    }

    async fn switch_model(&self, model_id: &str) -> Result<(), GatewayError> {
        self.post_json("/model", json!({ "model_id": model_id })).await.map(|_| ())
    }

    async fn apply_auth_profile(&self, profile_path: &str) -> Result<(), GatewayError> {
        self.post_json("/auth-profile", json!({ "profile_path": profile_path })).await.map(|_| ())
    }

    async fn clear_chat_history(&self, cancel_check: CancelCheck) -> Result<(), GatewayError> {
        if cancel_check() {
            return Err(GatewayError::ClientCancelled);
        }
        self.post_json("/clear", json!({})).await.map(|_| ())
    }

    async fn stop_generation(&self) -> Result<(), GatewayError> {
        self.post_json("/stop", json!({})).await.map(|_| ())
    }

    async fn reload(&self) -> Result<(), GatewayError> {
        self.post_json("/reload", json!({})).await.map(|_| ())
    }

    async fn save_cookies(&self, profile_path: &str) -> Result<bool, GatewayError> {
        let response = self.post_json("/save-cookies", json!({ "profile_path": profile_path })).await?;
        Ok(response.get("saved").and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Runs raw bytes off the bridge's per-request stream through the same
/// chunked+gzip+wire decoding the interceptor defines, surfacing decoded
/// [`InterceptorEvent`]s one at a time.
struct HttpBridgeStream {
    bytes: ByteStream,
    interceptor: HttpInterceptor,
    pending: VecDeque<InterceptorEvent>,
    finished: bool,
}

#[async_trait]
impl InterceptorStream for HttpBridgeStream {
    async fn next_event(&mut self) -> Option<InterceptorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    let result = self.interceptor.process_response_chunk(&chunk);
                    self.finished = result.done;
                    self.pending.extend(result.events);
                }
                Some(Err(err)) => {
                    self.finished = true;
                    self.pending.push_back(InterceptorEvent::Error(format!("bridge stream error: {err}")));
                }
                None => self.finished = true,
            }
        }
    }
}

#[async_trait]
impl ResponseCapture for HttpBridgeController {
    async fn open_stream(&self, req_id: &str) -> Box<dyn InterceptorStream> {
        let url = format!("{}/stream/{}", self.base_url, req_id);
        match self.client.get(&url).send().await {
            Ok(response) => Box::new(HttpBridgeStream {
                bytes: Box::pin(response.bytes_stream()),
                interceptor: HttpInterceptor::new(),
                pending: VecDeque::new(),
                finished: false,
            }),
            Err(err) => Box::new(HttpBridgeStream {
                bytes: Box::pin(futures::stream::empty()),
                interceptor: HttpInterceptor::new(),
                pending: VecDeque::from([InterceptorEvent::Error(format!("failed to open bridge stream: {err}"))]),
                finished: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_pending_events_before_pulling_more_bytes() {
        let mut stream = HttpBridgeStream {
            bytes: Box::pin(futures::stream::empty()),
            interceptor: HttpInterceptor::new(),
            pending: VecDeque::from([InterceptorEvent::Body("a".to_string()), InterceptorEvent::Done]),
            finished: false,
        };
        assert!(matches!(stream.next_event().await, Some(InterceptorEvent::Body(_))));
        assert!(matches!(stream.next_event().await, Some(InterceptorEvent::Done)));
        assert!(stream.next_event().await.is_none());
    }
}
