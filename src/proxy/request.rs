// OpenAI chat request -> upstream request

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::models::{resolve_model, ModelTable, ResolvedModel};
use crate::auth::Credential;

const MIN_OUTPUT_TOKENS: u64 = 8192;
const DEFAULT_OUTPUT_TOKENS: u64 = 65535;

/// Headers that must not be replayed from the captured request
const STRIPPED_HEADERS: &[&str] = &[
    "content-length",
    "host",
    "connection",
    "accept-encoding",
    "content-type",
];

fn default_model() -> String {
    "gemini-1.5-pro".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<StopSequences>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "developer")]
    System,
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(v) => v.clone(),
        }
    }
}

impl MessageContent {
    /// Text parts joined; images dropped
    fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

pub fn build_upstream_request(
    credential: &Credential,
    request: &ChatRequest,
    table: &ModelTable,
) -> UpstreamRequest {
    let resolved = resolve_model(&request.model, table);
    tracing::info!(
        "Switching model to: {} (requested: {})",
        resolved.model,
        request.model
    );

    UpstreamRequest {
        method: credential.method.clone(),
        url: credential.url.clone(),
        headers: build_headers(&credential.headers),
        body: build_body(&credential.body_template, request, &resolved),
    }
}

pub fn build_headers(captured: &HashMap<String, String>) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = captured
        .iter()
        .filter(|(name, _)| {
            !STRIPPED_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers
}

pub fn build_body(template: &Value, request: &ChatRequest, resolved: &ResolvedModel) -> Value {
    let mut variables = match template.get("variables") {
        Some(Value::Object(vars)) => vars.clone(),
        _ => Map::new(),
    };

    let (system, contents) = convert_messages(&request.messages);
    variables.insert("contents".to_string(), Value::Array(contents));
    if system.is_empty() {
        variables.remove("systemInstruction");
    } else {
        variables.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    variables.insert("safetySettings".to_string(), safety_settings());
    variables.insert("model".to_string(), Value::String(resolved.model.clone()));

    if !variables
        .get("generationConfig")
        .map(Value::is_object)
        .unwrap_or(false)
    {
        variables.insert("generationConfig".to_string(), json!({}));
    }
    if let Some(Value::Object(gen_config)) = variables.get_mut("generationConfig") {
        apply_generation_config(gen_config, request, resolved);
    }

    let mut body = Map::new();
    for key in ["querySignature", "operationName"] {
        if let Some(value) = template.get(key) {
            body.insert(key.to_string(), value.clone());
        }
    }
    body.insert("variables".to_string(), Value::Object(variables));
    Value::Object(body)
}

fn safety_settings() -> Value {
    let categories = [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_CIVIC_INTEGRITY",
    ];
    Value::Array(
        categories
            .iter()
            .map(|c| json!({"category": c, "threshold": "BLOCK_NONE"}))
            .collect(),
    )
}

/// Returns the joined system prompt and the upstream `contents` array
fn convert_messages(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for msg in messages {
        let Some(content) = &msg.content else {
            continue;
        };
        match msg.role {
            Role::System => system.push(content.text()),
            Role::User => contents.push(json!({"role": "user", "parts": user_parts(content)})),
            Role::Assistant => {
                contents.push(json!({"role": "model", "parts": [{"text": content.text()}]}))
            }
            Role::Other => tracing::debug!("Skipping message with unsupported role"),
        }
    }

    (system.join("\n").trim().to_string(), contents)
}

fn user_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"text": text})),
                ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
                    Some((mime_type, data)) => Some(json!({
                        "inlineData": {"mimeType": mime_type, "data": data}
                    })),
                    None => {
                        tracing::warn!("Skipping image that is not a valid base64 data URL");
                        None
                    }
                },
                ContentPart::Unsupported => None,
            })
            .collect(),
    }
}

/// `data:<mime>;base64,<payload>` -> (mime, payload)
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime = header.split(';').next()?.trim();
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(data).ok()?;
    Some((mime.to_string(), data.to_string()))
}

fn apply_generation_config(
    gen_config: &mut Map<String, Value>,
    request: &ChatRequest,
    resolved: &ResolvedModel,
) {
    match resolved.thinking {
        Some(level) => {
            let budget = level.budget();
            gen_config.insert(
                "thinkingConfig".to_string(),
                json!({
                    "includeThoughts": true,
                    "thinkingBudget": budget,
                    "budget_token_count": budget,
                }),
            );
            tracing::info!("Configured thinking: {:?}, budget={}", level, budget);
        }
        None => {
            gen_config.remove("thinkingConfig");
            gen_config.remove("thinking_config");
        }
    }

    match resolved.resolution {
        Some(resolution) => {
            gen_config
                .entry("responseModalities")
                .or_insert_with(|| json!(["TEXT", "IMAGE"]));
            let image_config = gen_config
                .entry("imageConfig")
                .or_insert_with(|| json!({}));
            if !image_config.is_object() {
                *image_config = json!({});
            }
            if let Value::Object(image_config) = image_config {
                image_config.insert("imageSize".to_string(), json!(resolution.image_size()));
                image_config.insert("personGeneration".to_string(), json!("ALLOW_ALL"));
                image_config
                    .entry("imageOutputOptions")
                    .or_insert_with(|| json!({"mimeType": "image/png"}));
                image_config
                    .entry("aspectRatio")
                    .or_insert_with(|| json!("1:1"));
            }
            tracing::info!("Configured image generation: size={}", resolution.image_size());
        }
        None => {
            for key in ["imageConfig", "sampleImageSize", "width", "height"] {
                gen_config.remove(key);
            }
        }
    }

    let template_max = gen_config.get("maxOutputTokens").and_then(Value::as_u64);
    let max_tokens = match template_max {
        Some(n) if n >= MIN_OUTPUT_TOKENS => n,
        _ => DEFAULT_OUTPUT_TOKENS,
    };
    gen_config.insert("maxOutputTokens".to_string(), json!(max_tokens));

    if let Some(temperature) = request.temperature {
        gen_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        gen_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = request.top_k {
        gen_config.insert("topK".to_string(), json!(top_k));
    }
    if let Some(max_tokens) = request.max_tokens {
        gen_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(stop) = &request.stop {
        gen_config.insert("stopSequences".to_string(), json!(stop.to_vec()));
    }

    let dump = Value::Object(gen_config.clone());
    tracing::debug!("Generation config: {}", dump);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_credential;

    fn chat(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_parse_chat_request() {
        let req = chat(json!({
            "model": "gemini-3-pro",
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGVsbG8="}},
                    {"type": "input_audio", "input_audio": {}}
                ]},
                {"role": "tool", "content": "ignored"}
            ],
            "stop": "END",
            "stream": true
        }));
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[2].role, Role::Other);
        assert!(req.stream);
        assert_eq!(req.stop.unwrap().to_vec(), vec!["END"]);
    }

    #[test]
    fn test_messages_are_converted() {
        let req = chat(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "system", "content": "one"},
                {"role": "system", "content": "two "},
                {"role": "user", "content": [
                    {"type": "text", "text": "see"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,aGVsbG8="}},
                    {"type": "image_url", "image_url": {"url": "https://remote.test/x.png"}},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,@@@"}}
                ]},
                {"role": "assistant", "content": "ok"}
            ]
        }));
        let credential = sample_credential("https://example.test/a");
        let upstream = build_upstream_request(&credential, &req, &ModelTable::default());
        let vars = &upstream.body["variables"];

        assert_eq!(vars["systemInstruction"]["parts"][0]["text"], "one\ntwo");
        assert_eq!(vars["contents"][0]["role"], "user");
        let parts = vars["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(vars["contents"][1]["role"], "model");
        assert_eq!(vars["contents"][1]["parts"][0]["text"], "ok");
        assert_eq!(vars["model"], "gemini-2.5-flash");
        assert_eq!(vars["safetySettings"].as_array().unwrap().len(), 5);
        assert_eq!(vars["safetySettings"][4]["category"], "HARM_CATEGORY_CIVIC_INTEGRITY");
        assert_eq!(upstream.body["operationName"], "StreamGenerateContent");
        assert_eq!(upstream.body["querySignature"], "sig");
    }

    #[test]
    fn test_generation_config_cleanup_and_floor() {
        let req = chat(json!({"model": "gemini-2.5-flash", "messages": [{"role": "user", "content": "hi"}]}));
        let credential = sample_credential("https://example.test/a");
        let upstream = build_upstream_request(&credential, &req, &ModelTable::default());
        let gen = &upstream.body["variables"]["generationConfig"];

        assert!(gen.get("thinkingConfig").is_none());
        assert!(gen.get("imageConfig").is_none());
        assert_eq!(gen["maxOutputTokens"], 65535);
        assert_eq!(gen["temperature"], 1.0);
        assert!(upstream.body["variables"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_suffixes_configure_thinking_and_images() {
        let req = chat(json!({
            "model": "gemini-3-pro-high-4k",
            "messages": [{"role": "user", "content": "draw"}],
            "temperature": 0.2,
            "top_p": 0.9,
            "top_k": 40,
            "max_tokens": 1000,
            "stop": ["a", "b"]
        }));
        let credential = sample_credential("https://example.test/a");
        let upstream = build_upstream_request(&credential, &req, &ModelTable::default());
        let vars = &upstream.body["variables"];
        let gen = &vars["generationConfig"];

        assert_eq!(vars["model"], "gemini-3-pro");
        assert_eq!(gen["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(gen["thinkingConfig"]["thinkingBudget"], 32768);
        assert_eq!(gen["thinkingConfig"]["budget_token_count"], 32768);
        assert_eq!(gen["responseModalities"], json!(["TEXT", "IMAGE"]));
        assert_eq!(gen["imageConfig"]["imageSize"], "4K");
        assert_eq!(gen["imageConfig"]["aspectRatio"], "1:1");
        assert_eq!(gen["imageConfig"]["personGeneration"], "ALLOW_ALL");
        assert_eq!(gen["imageConfig"]["imageOutputOptions"]["mimeType"], "image/png");
        assert_eq!(gen["temperature"], 0.2);
        assert_eq!(gen["topP"], 0.9);
        assert_eq!(gen["topK"], 40);
        assert_eq!(gen["maxOutputTokens"], 1000);
        assert_eq!(gen["stopSequences"], json!(["a", "b"]));
    }

    #[test]
    fn test_headers_are_filtered_without_touching_credential() {
        let credential = sample_credential("https://example.test/a");
        let headers = build_headers(&credential.headers);

        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("content-length")));
        assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("host")));
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["Cookie"], "SID=abc");
        assert!(credential.headers.contains_key("Content-Length"));
    }

    #[test]
    fn test_parse_data_url() {
        assert_eq!(
            parse_data_url("data:image/png;base64,aGVsbG8="),
            Some(("image/png".to_string(), "aGVsbG8=".to_string()))
        );
        assert_eq!(parse_data_url("data:image/png;base64,"), None);
        assert_eq!(parse_data_url("https://x.test/a.png"), None);
        assert_eq!(parse_data_url("data:image/png;base64,not base64!"), None);
    }
}
