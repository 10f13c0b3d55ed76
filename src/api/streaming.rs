// SSE encoding of gateway events

use axum::response::sse::{Event, Sse};
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;

use crate::proxy::translator::StreamEvent;
use crate::proxy::Completion;

/// Identity shared by every chunk of one reply
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub id: String,
    pub model: String,
    pub created: i64,
}

impl ChunkContext {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-proxy-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        })
    }
}

/// The `data:` payload for one event
pub fn event_data(event: &StreamEvent, ctx: &ChunkContext) -> String {
    match event {
        StreamEvent::Content(text) => ctx.chunk(json!({"content": text}), None).to_string(),
        StreamEvent::Reasoning(text) => ctx
            .chunk(json!({"reasoning_content": text}), None)
            .to_string(),
        StreamEvent::Finish(reason) => ctx.chunk(json!({}), Some(reason)).to_string(),
        StreamEvent::Error { message, kind } => {
            json!({"error": {"message": message, "type": kind}}).to_string()
        }
        StreamEvent::Done => "[DONE]".to_string(),
    }
}

pub fn openai_sse<S>(events: S, model: &str) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let ctx = ChunkContext::new(model);
    Sse::new(events.map(move |event| Ok(Event::default().data(event_data(&event, &ctx)))))
}

/// Non-streaming `chat.completion` object
pub fn completion_response(completion: &Completion, model: &str) -> Value {
    json!({
        "id": format!("chatcmpl-proxy-nonstream-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": completion.content
            },
            "finish_reason": completion.finish_reason
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0
        }
    })
}
