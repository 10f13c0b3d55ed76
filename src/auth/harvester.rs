// Harvester agent registry and wire protocol

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::refresh::RefreshBroadcaster;
use super::HarvestPayload;

/// Inbound messages from harvesting agents
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvesterMessage {
    CredentialsHarvested { data: HarvestPayload },
    TokenRefreshed { token: String },
    RefreshComplete,
    Identify { client: String },
}

/// Outbound commands to harvesting agents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvesterCommand {
    RefreshToken,
}

pub type HarvesterId = u64;

struct HarvesterClient {
    name: Option<String>,
    tx: mpsc::UnboundedSender<HarvesterCommand>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvesterInfo {
    pub id: HarvesterId,
    pub name: Option<String>,
}

#[derive(Default)]
pub struct HarvesterHub {
    clients: Mutex<HashMap<HarvesterId, HarvesterClient>>,
    next_id: AtomicU64,
}

impl HarvesterHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (HarvesterId, mpsc::UnboundedReceiver<HarvesterCommand>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.lock().insert(id, HarvesterClient { name: None, tx });
        tracing::info!("Harvester #{} connected ({} total)", id, self.client_count());
        (id, rx)
    }

    pub fn unregister(&self, id: HarvesterId) {
        let removed = self.clients.lock().remove(&id);
        if let Some(client) = removed {
            tracing::info!(
                "Harvester #{} ({}) disconnected",
                id,
                client.name.as_deref().unwrap_or("unnamed")
            );
        }
    }

    pub fn identify(&self, id: HarvesterId, name: String) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            tracing::info!("Harvester #{} identified as {}", id, name);
            client.name = Some(name);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn clients(&self) -> Vec<HarvesterInfo> {
        let mut list: Vec<_> = self
            .clients
            .lock()
            .iter()
            .map(|(id, c)| HarvesterInfo {
                id: *id,
                name: c.name.clone(),
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

impl RefreshBroadcaster for HarvesterHub {
    fn request_refresh(&self) -> usize {
        let mut clients = self.clients.lock();
        // Drop clients whose socket task already ended
        clients.retain(|id, client| {
            let alive = client.tx.send(HarvesterCommand::RefreshToken).is_ok();
            if !alive {
                tracing::debug!("Dropping closed harvester #{}", id);
            }
            alive
        });
        clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_credentials_harvested() {
        let json = r#"{
            "type": "credentials_harvested",
            "data": {"url": "https://u.test/x", "headers": {"Cookie": "a"}, "body": "{\"variables\":{}}"}
        }"#;
        let msg: HarvesterMessage = serde_json::from_str(json).unwrap();
        match msg {
            HarvesterMessage::CredentialsHarvested { data } => {
                assert_eq!(data.url, "https://u.test/x");
                assert_eq!(data.method, "POST");
                assert!(data.body.is_string());
            }
            other => panic!("Expected CredentialsHarvested, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_simple_messages() {
        let msg: HarvesterMessage =
            serde_json::from_str(r#"{"type": "token_refreshed", "token": "abc"}"#).unwrap();
        assert!(matches!(msg, HarvesterMessage::TokenRefreshed { token } if token == "abc"));

        let msg: HarvesterMessage = serde_json::from_str(r#"{"type": "refresh_complete"}"#).unwrap();
        assert!(matches!(msg, HarvesterMessage::RefreshComplete));

        assert!(serde_json::from_str::<HarvesterMessage>(r#"{"type": "bogus"}"#).is_err());
    }

    #[test]
    fn test_serialize_refresh_command() {
        let json = serde_json::to_string(&HarvesterCommand::RefreshToken).unwrap();
        assert_eq!(json, r#"{"type":"refresh_token"}"#);
    }

    #[test]
    fn test_broadcast_reaches_live_clients_only() {
        let hub = HarvesterHub::new();
        assert_eq!(hub.request_refresh(), 0);

        let (a, mut rx_a) = hub.register();
        let (_b, rx_b) = hub.register();
        hub.identify(a, "userscript".to_string());
        drop(rx_b);

        assert_eq!(hub.request_refresh(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), HarvesterCommand::RefreshToken);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.clients()[0].name.as_deref(), Some("userscript"));

        hub.unregister(a);
        assert_eq!(hub.client_count(), 0);
    }
}
