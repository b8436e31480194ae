//! Response assembly (spec.md §4.4).
//!
//! Consumes the interceptor's per-request event stream and produces
//! either a consolidated non-streaming completion or a sequence of
//! `chat.completion.chunk` fragments for SSE. Streaming vs non-streaming
//! share the same draining loop; only the silence-detection and output
//! shape differ.

use std::time::Duration;

use crate::capability::InterceptorEvent;
use crate::domain::{
    chat_completion_id, ChatCompletionChunk, ChatCompletionResponse, Choice, Delta, ResponseMessage,
    StreamChoice, ToolCall, ToolCallFunction, Usage, SYSTEM_FINGERPRINT,
};
use crate::pipeline::disconnect::CompletionEvent;

#[derive(Debug, Default)]
pub struct ConsolidatedOutput {
    pub body: String,
    pub reasoning: String,
    pub function_calls: Vec<(String, serde_json::Value)>,
}

impl ConsolidatedOutput {
    /// Reasoning is presented first, separated from body text by a blank
    /// line (spec.md §4.4, mirrors the source's consolidation order).
    pub fn consolidated_text(&self) -> String {
        let reasoning = self.reasoning.trim();
        let body = self.body.trim();
        let mut out = String::new();
        if !reasoning.is_empty() {
            out.push_str(reasoning);
        }
        if !body.is_empty() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(body);
        }
        out
    }

    pub fn finish_reason(&self) -> &'static str {
        if self.function_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        }
    }
}

#[derive(Debug)]
pub enum DrainOutcome {
    Done(ConsolidatedOutput),
    UpstreamError(String),
    SilenceTimeout,
    Disconnected,
}

/// Drains an interceptor event stream to completion (non-streaming
/// mode, or the initial full-drain path before chunk-by-chunk emission
/// is needed). `silence_threshold` is `None` for non-streaming requests
/// per spec.md §4.4 ("disables silence detection").
pub async fn drain(
    stream: &mut dyn crate::capability::InterceptorStream,
    completion: &CompletionEvent,
    silence_threshold: Option<Duration>,
) -> DrainOutcome {
    let mut output = ConsolidatedOutput::default();
    loop {
        let next = match silence_threshold {
            Some(threshold) => {
                tokio::select! {
                    _ = completion.wait() => return DrainOutcome::Disconnected,
                    event = stream.next_event() => event,
                    _ = tokio::time::sleep(threshold) => return DrainOutcome::SilenceTimeout,
                }
            }
            None => {
                tokio::select! {
                    _ = completion.wait() => return DrainOutcome::Disconnected,
                    event = stream.next_event() => event,
                }
            }
        };

        match next {
            Some(InterceptorEvent::Body(text)) => output.body.push_str(&text),
            Some(InterceptorEvent::Reason(text)) => output.reasoning.push_str(&text),
            Some(InterceptorEvent::Function { name, arguments }) => output.function_calls.push((name, arguments)),
            Some(InterceptorEvent::Done) | None => return DrainOutcome::Done(output),
            Some(InterceptorEvent::Error(msg)) => return DrainOutcome::UpstreamError(msg),
        }
    }
}

/// Rough token estimate (~4 characters/token), used only for the
/// `usage` block; the upstream does not expose real token counts.
pub fn estimate_tokens(prompt_text: &str, completion_text: &str) -> Usage {
    let prompt_tokens = char_estimate(prompt_text);
    let completion_tokens = char_estimate(completion_text);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

fn char_estimate(text: &str) -> u32 {
    ((text.chars().count() as f64) / 4.0).ceil() as u32
}

pub fn build_non_streaming_response(
    req_id: &str,
    model: &str,
    created: i64,
    output: &ConsolidatedOutput,
    usage: Usage,
) -> ChatCompletionResponse {
    let finish_reason = output.finish_reason();
    let tool_calls = if output.function_calls.is_empty() {
        None
    } else {
        Some(
            output
                .function_calls
                .iter()
                .enumerate()
                .map(|(i, (name, args))| ToolCall {
                    id: format!("call_{req_id}_{i}"),
                    kind: "function",
                    function: ToolCallFunction { name: name.clone(), arguments: args.to_string() },
                })
                .collect(),
        )
    };
    let content = if tool_calls.is_some() { None } else { Some(output.consolidated_text()) };

    ChatCompletionResponse {
        id: chat_completion_id(req_id, created),
        object: "chat.completion",
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage { role: "assistant", content, tool_calls },
            finish_reason: finish_reason.to_string(),
            native_finish_reason: finish_reason.to_string(),
        }],
        usage,
        system_fingerprint: SYSTEM_FINGERPRINT,
        seed: None,
        response_format: None,
    }
}

/// Builds the single-choice `tool_calls` response for a locally-resolved
/// tool call (spec.md §4.1.1): the dispatch result is embedded as the
/// call's `arguments`, `content` is always null, no browser round trip
/// occurred.
pub fn build_local_tool_call_response(req_id: &str, model: &str, created: i64, function_name: &str, result: &serde_json::Value) -> ChatCompletionResponse {
    let tool_call = ToolCall {
        id: format!("call_{req_id}_0"),
        kind: "function",
        function: ToolCallFunction { name: function_name.to_string(), arguments: result.to_string() },
    };
    ChatCompletionResponse {
        id: chat_completion_id(req_id, created),
        object: "chat.completion",
        created,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage { role: "assistant", content: None, tool_calls: Some(vec![tool_call]) },
            finish_reason: "tool_calls".to_string(),
            native_finish_reason: "tool_calls".to_string(),
        }],
        usage: Usage { prompt_tokens: 0, completion_tokens: 0, total_tokens: 0 },
        system_fingerprint: SYSTEM_FINGERPRINT,
        seed: None,
        response_format: None,
    }
}

/// A 10 KiB+ serialized body is emitted as chunked transfer with ≤8 KiB
/// pieces instead of a single buffered write (spec.md §4.4).
pub const CHUNK_THRESHOLD_BYTES: usize = 10 * 1024;
pub const CHUNK_PIECE_BYTES: usize = 8 * 1024;

pub fn chunk_body(serialized: &str) -> Vec<String> {
    if serialized.len() <= CHUNK_THRESHOLD_BYTES {
        return vec![serialized.to_string()];
    }
    serialized
        .as_bytes()
        .chunks(CHUNK_PIECE_BYTES)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

pub fn text_chunk(id: &str, model: &str, created: i64, text: String) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![StreamChoice { index: 0, delta: Delta { content: Some(text), tool_calls: None }, finish_reason: None }],
        usage: None,
    }
}

pub fn function_chunk(id: &str, model: &str, created: i64, index: usize, name: &str, arguments: &serde_json::Value) -> ChatCompletionChunk {
    let call = ToolCall {
        id: format!("call_{id}_{index}"),
        kind: "function",
        function: ToolCallFunction { name: name.to_string(), arguments: arguments.to_string() },
    };
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![StreamChoice { index: 0, delta: Delta { content: None, tool_calls: Some(vec![call]) }, finish_reason: None }],
        usage: None,
    }
}

pub fn final_chunk(id: &str, model: &str, created: i64, finish_reason: &str, usage: Option<Usage>) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![StreamChoice { index: 0, delta: Delta::default(), finish_reason: Some(finish_reason.to_string()) }],
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consolidates_reasoning_before_body() {
        let output = ConsolidatedOutput {
            body: "the answer".to_string(),
            reasoning: "thinking it through".to_string(),
            function_calls: vec![],
        };
        assert_eq!(output.consolidated_text(), "thinking it through\n\nthe answer");
    }

    #[test]
    fn body_only_has_no_separator() {
        let output = ConsolidatedOutput { body: "hi".to_string(), reasoning: String::new(), function_calls: vec![] };
        assert_eq!(output.consolidated_text(), "hi");
    }

    #[test]
    fn small_body_is_not_chunked() {
        assert_eq!(chunk_body("short").len(), 1);
    }

    #[test]
    fn large_body_is_split_into_8kib_pieces() {
        let big = "x".repeat(CHUNK_THRESHOLD_BYTES + 1024);
        let pieces = chunk_body(&big);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.len() <= CHUNK_PIECE_BYTES));
    }

    #[test]
    fn token_estimate_is_roughly_four_chars_per_token() {
        let usage = estimate_tokens("abcd", "abcdabcd");
        assert_eq!(usage.prompt_tokens, 1);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 3);
    }
}
