//! Upstream response interceptor (spec.md §4.3).
//!
//! Sits conceptually between the browser and the upstream server. It is
//! fed raw bytes captured off the wire (capture mechanism is the
//! browser-driver's concern, out of scope here) and reconstructs streamed
//! text, reasoning, and tool-call arguments from AI Studio's chunked+gzip,
//! length-tagged response format.

pub mod wire;

use std::collections::HashSet;

use flate2::read::DeflateDecoder;
use regex::bytes::Regex;
use serde_json::Value;

use crate::capability::InterceptorEvent;

const BUFFER_LIMIT_BYTES: usize = 10 * 1024 * 1024;

fn anchor_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"\[\[\[null,.*?]],"model"]"#).unwrap())
}

pub fn should_intercept(path: &str) -> bool {
    path.contains("GenerateContent") || path.contains("generateContent") || path.contains("jserror")
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaSignal {
    None,
    RateLimit,
    QuotaExceeded,
}

/// Inspects a URL-decoded `jserror` query string for the keywords the
/// design doc names, classifying rate-limit vs quota-exhausted.
pub fn classify_jserror_query(decoded_query: &str) -> QuotaSignal {
    let lower = decoded_query.to_lowercase();
    if lower.contains("exceeded quota") || lower.contains("resource_exhausted") {
        QuotaSignal::QuotaExceeded
    } else if lower.contains("failed to generate content") {
        QuotaSignal::QuotaExceeded
    } else if lower.contains("too many requests") {
        QuotaSignal::RateLimit
    } else {
        QuotaSignal::None
    }
}

/// Result of feeding one HTTP response chunk through the interceptor.
#[derive(Debug, Default)]
pub struct InterceptResult {
    pub events: Vec<InterceptorEvent>,
    pub done: bool,
}

/// Reassembles HTTP/1.1 chunked transfer encoding. Returns the decoded
/// body and whether the terminal `0\r\n\r\n` chunk was observed. Never
/// raises: a missing tail chunk returns what it has with `done=false`.
pub fn decode_chunked(mut body: &[u8]) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    loop {
        let Some(crlf) = find_subslice(body, b"\r\n") else {
            break;
        };
        let Ok(hex_len) = std::str::from_utf8(&body[..crlf]) else {
            break;
        };
        let Ok(length) = usize::from_str_radix(hex_len.trim(), 16) else {
            break;
        };

        if length == 0 {
            if find_subslice(body, b"0\r\n\r\n").is_some() {
                return (out, true);
            }
            break;
        }

        if crlf + 2 + length > body.len() {
            break;
        }
        out.extend_from_slice(&body[crlf + 2..crlf + 2 + length]);

        if crlf + 2 + length + 2 > body.len() {
            break;
        }
        body = &body[crlf + 2 + length + 2..];
    }
    (out, false)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decompresses gzip/deflate with a header-auto-detecting window
/// (`MAX_WBITS | 32` equivalent): tries zlib/gzip-wrapped deflate first,
/// falls back to raw deflate, falls back to the input unchanged if
/// neither parses (keeps the caller's buffering strategy robust to
/// partial streams).
pub fn decompress_zlib_stream(data: &[u8]) -> Vec<u8> {
    use std::io::Read;

    if let Ok(mut gz) = try_gzip(data) {
        let mut out = Vec::new();
        if gz.read_to_end(&mut out).is_ok() && !out.is_empty() {
            return out;
        }
    }
    let mut deflater = DeflateDecoder::new(data);
    let mut out = Vec::new();
    if deflater.read_to_end(&mut out).is_ok() && !out.is_empty() {
        return out;
    }
    data.to_vec()
}

fn try_gzip(data: &[u8]) -> std::io::Result<flate2::read::GzDecoder<&[u8]>> {
    Ok(flate2::read::GzDecoder::new(data))
}

/// Persistent per-connection state: accumulates a UTF-8 buffer across
/// response chunks, scans it for complete wire-format matches, and
/// deduplicates function-call payloads across the life of one logical
/// response.
pub struct HttpInterceptor {
    buffer: String,
    seen_function_calls: HashSet<(String, String)>,
}

impl Default for HttpInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpInterceptor {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            seen_function_calls: HashSet::new(),
        }
    }

    /// Resets interceptor state for a new request; must be called at the
    /// start of each new `GenerateContent` submission (pipeline cleanup
    /// step, spec.md §4.1).
    pub fn reset_for_new_request(&mut self) {
        self.buffer.clear();
        self.seen_function_calls.clear();
    }

    /// Feeds one raw HTTP response chunk (still chunked+gzip encoded)
    /// through decode -> decompress -> buffer -> parse.
    pub fn process_response_chunk(&mut self, chunk: &[u8]) -> InterceptResult {
        let (decoded, is_done) = decode_chunked(chunk);
        let decompressed = decompress_zlib_stream(&decoded);
        let Ok(text) = String::from_utf8(decompressed) else {
            return InterceptResult { events: vec![], done: is_done };
        };
        self.buffer.push_str(&text);
        self.parse_buffer(is_done)
    }

    fn parse_buffer(&mut self, is_done: bool) -> InterceptResult {
        let mut result = InterceptResult { events: vec![], done: is_done };

        if self.buffer.len() > BUFFER_LIMIT_BYTES {
            tracing::warn!("interceptor buffer exceeded 10MiB, resetting");
            crate::telemetry::track_buffer_reset();
            self.buffer.clear();
            return result;
        }

        let buffer_bytes = self.buffer.as_bytes().to_vec();
        let matches: Vec<_> = anchor_pattern().find_iter(&buffer_bytes).collect();
        if matches.is_empty() {
            return result;
        }

        for m in &matches {
            let Ok(json_data) = serde_json::from_slice::<Value>(m.as_bytes()) else {
                continue;
            };
            let Some(payload) = json_data.get(0).and_then(|v| v.get(0)).and_then(|v| v.as_array())
            else {
                continue;
            };

            match payload.len() {
                2 => {
                    if let Some(text) = payload[1].as_str() {
                        result.events.push(InterceptorEvent::Body(text.to_string()));
                    }
                }
                11 if payload[1].is_null() => {
                    if let Some(call) = payload[10].as_array() {
                        if call.len() >= 2 {
                            if let Some(name) = call[0].as_str() {
                                let args = wire::parse_toolcall_params(&call[1]);
                                let key = (name.to_string(), wire::canonical_json(&args));
                                if self.seen_function_calls.insert(key) {
                                    result.events.push(InterceptorEvent::Function {
                                        name: name.to_string(),
                                        arguments: args,
                                    });
                                }
                            }
                        }
                    }
                }
                n if n > 2 => {
                    if let Some(text) = payload[1].as_str() {
                        result.events.push(InterceptorEvent::Reason(text.to_string()));
                    }
                }
                _ => {}
            }
        }

        let last_end = matches.last().unwrap().end();
        if last_end < buffer_bytes.len() {
            self.buffer = String::from_utf8_lossy(&buffer_bytes[last_end..]).into_owned();
        } else {
            self.buffer.clear();
        }

        if is_done {
            result.events.push(InterceptorEvent::Done);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_decode_partial_tail_is_not_an_error() {
        let body = b"5\r\nhello\r\n3\r\nwor"; // missing terminator and tail
        let (decoded, done) = decode_chunked(body);
        assert_eq!(decoded, b"hello");
        assert!(!done);
    }

    #[test]
    fn chunked_decode_complete_stream() {
        let body = b"5\r\nhello\r\n0\r\n\r\n";
        let (decoded, done) = decode_chunked(body);
        assert_eq!(decoded, b"hello");
        assert!(done);
    }

    #[test]
    fn length_preserving_reassembly() {
        let body = b"2\r\nhi\r\n4\r\n bye\r\n0\r\n\r\n".to_vec();
        let (decoded, done) = decode_chunked(&body);
        assert!(done);
        assert_eq!(decoded.len(), 2 + 4);
    }

    #[test]
    fn buffer_reset_on_overflow() {
        let mut interceptor = HttpInterceptor::new();
        interceptor.buffer = "x".repeat(BUFFER_LIMIT_BYTES + 1);
        let result = interceptor.parse_buffer(false);
        assert!(result.events.is_empty());
        assert!(interceptor.buffer.is_empty());
    }

    #[test]
    fn dedups_function_calls_across_chunks() {
        use serde_json::json;

        let args = json!([[["q", [null, null, "hi"]]]]);
        let payload = json!([
            null, null, null, null, null, null, null, null, null, null,
            ["search", args]
        ]);
        let json_data = json!([[payload], "model"]);
        let wire_line = json_data.to_string();

        let mut interceptor = HttpInterceptor::new();
        interceptor.buffer = wire_line.clone();
        let first = interceptor.parse_buffer(false);
        assert_eq!(first.events.len(), 1);
        assert!(matches!(first.events[0], InterceptorEvent::Function { .. }));

        interceptor.buffer = wire_line;
        let second = interceptor.parse_buffer(true);
        // duplicate suppressed; only the Done marker remains
        assert_eq!(second.events.len(), 1);
        assert!(matches!(second.events[0], InterceptorEvent::Done));
    }

    #[test]
    fn classifies_quota_exhausted() {
        assert_eq!(
            classify_jserror_query("error=RESOURCE_EXHAUSTED"),
            QuotaSignal::QuotaExceeded
        );
        assert_eq!(
            classify_jserror_query("msg=Too Many Requests"),
            QuotaSignal::RateLimit
        );
        assert_eq!(classify_jserror_query("msg=ok"), QuotaSignal::None);
    }
}
