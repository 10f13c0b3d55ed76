// Shared fixtures for unit tests

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::refresh::{RefreshBroadcaster, RefreshSignals};
use crate::auth::{Credential, CredentialStore};

pub fn sample_credential(url: &str) -> Credential {
    Credential {
        url: url.to_string(),
        method: "POST".to_string(),
        headers: HashMap::from([
            ("Cookie".to_string(), "SID=abc".to_string()),
            ("Content-Length".to_string(), "999".to_string()),
            ("Host".to_string(), "example.test".to_string()),
            (
                "X-Goog-First-Party-Reauth".to_string(),
                "[\"initial\"]".to_string(),
            ),
        ]),
        body_template: json!({
            "querySignature": "sig",
            "operationName": "StreamGenerateContent",
            "variables": {
                "contents": [],
                "model": "template-model",
                "generationConfig": {
                    "maxOutputTokens": 2048,
                    "thinkingConfig": {"thinkingBudget": 1},
                    "imageConfig": {"imageSize": "1K"},
                    "temperature": 1.0
                }
            }
        }),
        captured_at: chrono::Utc::now(),
    }
}

/// Stand-in for connected harvesters: counts refresh requests and, when
/// wired to a store, answers each one with a new credential.
pub struct FakeHarvester {
    pub calls: AtomicUsize,
    target: Option<(Arc<CredentialStore>, Arc<RefreshSignals>)>,
    urls: Mutex<VecDeque<String>>,
}

impl FakeHarvester {
    pub fn silent() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            target: None,
            urls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn delivering(store: Arc<CredentialStore>, signals: Arc<RefreshSignals>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            target: Some((store, signals)),
            urls: Mutex::new(VecDeque::new()),
        }
    }

    /// URLs handed out by successive refreshes; falls back to a numbered URL.
    pub fn with_urls(self, urls: &[String]) -> Self {
        self.urls.lock().extend(urls.iter().cloned());
        self
    }
}

impl RefreshBroadcaster for FakeHarvester {
    fn request_refresh(&self) -> usize {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let Some((store, signals)) = self.target.clone() else {
            return 0;
        };

        let url = self
            .urls
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("https://example.test/refreshed/{}", n));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.set(sample_credential(&url));
            signals.ui_settled.set();
        });
        1
    }
}
