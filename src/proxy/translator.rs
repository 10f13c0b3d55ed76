// Upstream stream decoding and translation
//
// The upstream answers with one JSON array whose elements arrive over time:
// `[{...}\n,{...}\n]`. There are no frame delimiters, so values are decoded
// straight off the front of a byte buffer as soon as they are complete.

use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::GatewayError;

static AUTH_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)recaptcha|authentication|token").expect("valid regex"));

/// Output of the translator, one step of an OpenAI-style reply
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    Finish(String),
    Error { message: String, kind: String },
    Done,
}

impl StreamEvent {
    pub fn from_error(err: &GatewayError) -> Self {
        StreamEvent::Error {
            message: err.to_string(),
            kind: err.error_type().to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete value, or None until more bytes arrive
    pub fn next_value(&mut self) -> Option<Value> {
        loop {
            let skip = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace() || matches!(b, b'[' | b',' | b']'))
                .count();
            self.buf.advance(skip);
            if self.buf.is_empty() {
                return None;
            }

            let decoded = {
                let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                match values.next() {
                    Some(Ok(value)) => Ok(Some((value, values.byte_offset()))),
                    Some(Err(e)) if e.is_eof() => Ok(None),
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                }
            };

            match decoded {
                Ok(Some((value, consumed))) => {
                    self.buf.advance(consumed);
                    return Some(value);
                }
                Ok(None) => return None,
                Err(e) => self.resync(&e),
            }
        }
    }

    /// Skip to the next plausible value start. Always consumes at least one byte.
    fn resync(&mut self, err: &serde_json::Error) {
        let preview = String::from_utf8_lossy(&self.buf[..self.buf.len().min(100)]).into_owned();
        tracing::warn!("Error parsing stream chunk: {}", err);
        tracing::debug!("Buffer start: {}", preview.trim());

        let skip = self.buf[1..]
            .iter()
            .position(|b| matches!(b, b'{' | b'['))
            .map(|pos| pos + 1)
            .unwrap_or(1);
        tracing::warn!("Skipping {} non-JSON bytes", skip);
        self.buf.advance(skip);
    }

    /// Bytes still buffered that never formed a value
    pub fn remaining(&self) -> usize {
        self.buf.iter().filter(|b| !b.is_ascii_whitespace() && **b != b']').count()
    }
}

/// Convert one decoded upstream value into events.
///
/// In-band errors that look like an expired session become `GatewayError::Auth`.
pub fn translate_chunk(value: &Value) -> Result<Vec<StreamEvent>, GatewayError> {
    let mut events = Vec::new();

    if let Some(err) = value.get("error") {
        tracing::warn!("Upstream stream error: {}", err);
        return Ok(events);
    }

    let Some(results) = value.get("results").and_then(Value::as_array) else {
        return Ok(events);
    };

    for result in results {
        if let Some(errors) = result.get("errors").and_then(Value::as_array) {
            for err in errors {
                let msg = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown Error");
                tracing::warn!("Upstream API error: {}", msg);
                if AUTH_FAILURE.is_match(msg) {
                    return Err(GatewayError::Auth(msg.to_string()));
                }
            }
            continue;
        }

        let Some(candidates) = result
            .pointer("/data/candidates")
            .and_then(Value::as_array)
        else {
            continue;
        };

        for candidate in candidates {
            let parts = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for part in parts {
                translate_part(part, &mut events);
            }

            let finish = candidate.get("finishReason").and_then(Value::as_str);
            let reason = match finish {
                Some("STOP") => "stop",
                Some("MAX_TOKENS") => "length",
                _ => continue,
            };
            if parts.iter().any(is_thought) {
                tracing::debug!("Suppressing premature finishReason during thinking");
            } else {
                events.push(StreamEvent::Finish(reason.to_string()));
            }
        }
    }

    Ok(events)
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool).unwrap_or(false)
}

fn translate_part(part: &Value, events: &mut Vec<StreamEvent>) {
    if let Some(text) = part.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            if is_thought(part) {
                events.push(StreamEvent::Reasoning(text.to_string()));
            } else {
                events.push(StreamEvent::Content(text.to_string()));
            }
        }
    }

    if let Some(inline) = part.get("inlineData") {
        let mime = inline.get("mimeType").and_then(Value::as_str);
        let data = inline.get("data").and_then(Value::as_str);
        if let (Some(mime), Some(data)) = (mime, data) {
            events.push(StreamEvent::Content(format!(
                "![Generated Image](data:{};base64,{})",
                mime, data
            )));
        }
    } else if let Some(uri) = part.get("uri").and_then(Value::as_str) {
        events.push(StreamEvent::Content(format!("![Generated Image]({})", uri)));
    }
}

/// What one network chunk decoded to. When decoding stopped on an upstream
/// failure, `error` is set and `events` holds everything decoded before it.
#[derive(Debug, Default)]
pub struct Feed {
    pub events: Vec<StreamEvent>,
    pub error: Option<GatewayError>,
}

/// Decoder plus translation for a single upstream attempt
#[derive(Debug, Default)]
pub struct StreamTranslator {
    decoder: FrameDecoder,
    emitted_content: bool,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Feed {
        self.decoder.push(bytes);
        let mut feed = Feed::default();
        while let Some(value) = self.decoder.next_value() {
            tracing::trace!("Upstream chunk: {}", value);
            let translated = match translate_chunk(&value) {
                Ok(translated) => translated,
                Err(e) => {
                    feed.error = Some(e);
                    break;
                }
            };
            if translated
                .iter()
                .any(|e| matches!(e, StreamEvent::Content(_) | StreamEvent::Reasoning(_)))
            {
                self.emitted_content = true;
            }
            feed.events.extend(translated);
        }
        feed
    }

    /// End of input; reports what was left undecoded
    pub fn finish(&self) -> usize {
        let leftover = self.decoder.remaining();
        if leftover > 0 {
            tracing::warn!("Upstream stream ended with {} undecoded bytes", leftover);
        }
        leftover
    }

    pub fn emitted_content(&self) -> bool {
        self.emitted_content
    }
}
