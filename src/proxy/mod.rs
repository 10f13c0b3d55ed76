// Chat completion gateway
//
// Each call runs an explicit state machine:
// Preflight -> Sending -> Streaming -> Done, with at most one detour through
// Retrying when the upstream rejects the credential.

pub mod client;
pub mod models;
pub mod request;
pub mod translator;

use futures::{Stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::refresh::RefreshCoordinator;
use crate::auth::Credential;
use crate::error::GatewayError;
use client::{UpstreamClient, UpstreamResponse};
use models::{default_models, load_model_table, ModelTable};
use request::{build_upstream_request, ChatRequest};
use translator::{StreamEvent, StreamTranslator};

const MAX_RETRIES: u32 = 1;

enum CallState {
    Preflight,
    Sending {
        credential: Arc<Credential>,
        attempt: u32,
    },
    Streaming {
        credential: Arc<Credential>,
        attempt: u32,
        response: UpstreamResponse,
        translator: StreamTranslator,
    },
    Retrying {
        failed: Arc<Credential>,
        attempt: u32,
        cause: GatewayError,
    },
    Done,
    Failed(GatewayError),
}

/// Status codes that usually mean the captured session expired
fn is_auth_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403)
}

/// Aggregated result of a non-streaming call
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
}

pub struct Gateway {
    client: UpstreamClient,
    coordinator: Arc<RefreshCoordinator>,
    models_path: PathBuf,
}

impl Gateway {
    pub fn new(client: UpstreamClient, coordinator: Arc<RefreshCoordinator>, models_path: PathBuf) -> Self {
        Self {
            client,
            coordinator,
            models_path,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    fn model_table(&self) -> ModelTable {
        load_model_table(&self.models_path).unwrap_or_else(|e| {
            tracing::warn!("Error loading model table: {}", e);
            ModelTable::default()
        })
    }

    pub fn list_models(&self) -> Vec<String> {
        match load_model_table(&self.models_path) {
            Ok(table) => table.models,
            Err(e) => {
                tracing::warn!("Error loading model table: {}", e);
                default_models()
            }
        }
    }

    /// OpenAI-style event stream for one call. Always ends with `Done`; a failure
    /// is reported as a single `Error` event right before it.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let call = self.call(request);
        async_stream::stream! {
            futures::pin_mut!(call);
            while let Some(item) = call.next().await {
                match item {
                    Ok(event) => yield event,
                    Err(e) => {
                        yield StreamEvent::from_error(&e);
                        yield StreamEvent::Done;
                    }
                }
            }
        }
    }

    /// Run the call to completion and aggregate it into a single reply
    pub async fn complete_chat(self: &Arc<Self>, request: ChatRequest) -> Result<Completion, GatewayError> {
        let call = self.call(request);
        futures::pin_mut!(call);

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut finish_reason = None;

        while let Some(item) = call.next().await {
            match item? {
                StreamEvent::Content(text) => content.push_str(&text),
                StreamEvent::Reasoning(text) => reasoning.push_str(&text),
                StreamEvent::Finish(reason) => finish_reason = Some(reason),
                // failures come back as `Err` from `call`
                StreamEvent::Error { .. } | StreamEvent::Done => break,
            }
        }

        let mut rendered = if reasoning.is_empty() {
            content
        } else {
            format!("**Reasoning:**\n{}\n\n**Response:**\n{}", reasoning, content)
        };
        if rendered.is_empty() {
            rendered = " ".to_string();
        }

        Ok(Completion {
            content: rendered,
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    /// The state machine. Yields events, then either `Ok(Done)` or one `Err`.
    fn call(
        self: &Arc<Self>,
        request: ChatRequest,
    ) -> impl Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static {
        let gateway = Arc::clone(self);
        async_stream::stream! {
            let table = gateway.model_table();
            let mut state = CallState::Preflight;

            loop {
                state = match state {
                    CallState::Preflight => match gateway.coordinator.ensure_credential().await {
                        Ok(credential) => CallState::Sending { credential, attempt: 0 },
                        Err(e) => CallState::Failed(e),
                    },

                    CallState::Sending { credential, attempt } => {
                        let upstream = build_upstream_request(&credential, &request, &table);
                        tracing::info!("Sending request to upstream (attempt {})", attempt + 1);
                        match gateway.client.send(&upstream).await {
                            Ok(response) if response.is_success() => CallState::Streaming {
                                credential,
                                attempt,
                                response,
                                translator: StreamTranslator::new(),
                            },
                            Ok(response) => {
                                let status = response.status();
                                let body = response.text().await;
                                tracing::error!("Upstream API error: {} - {}", status, body);
                                let cause = GatewayError::Upstream { status, body };
                                if is_auth_status(status) && attempt < MAX_RETRIES {
                                    CallState::Retrying { failed: credential, attempt, cause }
                                } else {
                                    CallState::Failed(cause)
                                }
                            }
                            Err(e) => CallState::Failed(e),
                        }
                    }

                    CallState::Streaming { credential, attempt, mut response, mut translator } => {
                        match response.next_chunk().await {
                            Ok(Some(bytes)) => {
                                let feed = translator.feed(&bytes);
                                for event in feed.events {
                                    yield Ok(event);
                                }
                                match feed.error {
                                    None => CallState::Streaming { credential, attempt, response, translator },
                                    Some(cause @ GatewayError::Auth(_)) if attempt < MAX_RETRIES => {
                                        CallState::Retrying { failed: credential, attempt, cause }
                                    }
                                    Some(e) => CallState::Failed(e),
                                }
                            }
                            Ok(None) => {
                                translator.finish();
                                if !translator.emitted_content() {
                                    tracing::warn!("Upstream returned an empty stream (200 OK but no content)");
                                }
                                CallState::Done
                            }
                            Err(e) => CallState::Failed(e),
                        }
                    }

                    CallState::Retrying { failed, attempt, cause } => {
                        tracing::warn!("{}; refreshing credentials and retrying", cause);
                        match gateway.coordinator.refresh_after_auth_failure(&failed).await {
                            Ok(credential) => CallState::Sending { credential, attempt: attempt + 1 },
                            Err(e) => {
                                tracing::error!("Credential refresh failed: {}", e);
                                CallState::Failed(cause)
                            }
                        }
                    }

                    CallState::Done => {
                        yield Ok(StreamEvent::Done);
                        break;
                    }

                    CallState::Failed(e) => {
                        tracing::error!("Request failed: {}", e);
                        yield Err(e);
                        break;
                    }
                };
            }
        }
    }
}
