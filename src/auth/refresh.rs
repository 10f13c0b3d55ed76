// Credential refresh coordination
//
// One refresh sequence runs at a time. Callers that arrive while a sequence is
// in flight queue on the lock and observe its outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{Credential, CredentialStore};
use crate::config::RefreshConfig;
use crate::error::GatewayError;

/// A level-triggered flag any number of tasks can wait on
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await,
            Ok(Ok(_))
        );
        ready
    }
}

/// `available`: a fresh credential landed. `ui_settled`: the harvester finished
/// its refresh and its page is usable again.
#[derive(Debug)]
pub struct RefreshSignals {
    pub available: Signal,
    pub ui_settled: Signal,
}

impl RefreshSignals {
    /// Both start set: a credential restored from disk is trusted until proven otherwise.
    pub fn new() -> Self {
        Self {
            available: Signal::new(true),
            ui_settled: Signal::new(true),
        }
    }
}

impl Default for RefreshSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out of refresh requests to harvesting agents
pub trait RefreshBroadcaster: Send + Sync {
    /// Ask every connected harvester for a new credential. Returns how many were reached.
    fn request_refresh(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub proactive_after: Duration,
    pub credential_timeout: Duration,
    pub ui_settled_timeout: Duration,
    pub grace_delay: Duration,
}

impl From<&RefreshConfig> for RefreshPolicy {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            proactive_after: Duration::from_secs(config.proactive_refresh_secs),
            credential_timeout: Duration::from_secs(config.credential_timeout_secs),
            ui_settled_timeout: Duration::from_secs(config.ui_settled_timeout_secs),
            grace_delay: Duration::from_millis(config.grace_delay_ms),
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from(&RefreshConfig::default())
    }
}

/// Count of finished refresh sequences and how the latest one ended
#[derive(Debug, Default)]
struct CycleRecord {
    completed: u64,
    timed_out: Option<(&'static str, Duration)>,
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    signals: Arc<RefreshSignals>,
    broadcaster: Arc<dyn RefreshBroadcaster>,
    lock: Mutex<()>,
    last_cycle: parking_lot::Mutex<CycleRecord>,
    policy: RefreshPolicy,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        signals: Arc<RefreshSignals>,
        broadcaster: Arc<dyn RefreshBroadcaster>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            signals,
            broadcaster,
            lock: Mutex::new(()),
            last_cycle: parking_lot::Mutex::new(CycleRecord::default()),
            policy,
        }
    }

    pub fn request_refresh(&self) -> usize {
        let reached = self.broadcaster.request_refresh();
        if reached == 0 {
            tracing::warn!("No harvesters connected; cannot request a credential refresh");
        } else {
            tracing::info!("Requested credential refresh from {} harvester(s)", reached);
        }
        reached
    }

    pub async fn await_credential(&self, timeout: Duration) -> bool {
        self.signals.available.clear();
        self.wait_available(timeout).await
    }

    pub async fn await_ui_settled(&self, timeout: Duration) -> bool {
        let settled = self.signals.ui_settled.wait(timeout).await;
        if !settled {
            tracing::warn!("Timed out waiting for harvester to finish refreshing");
        }
        settled
    }

    pub fn mark_ui_settled(&self) {
        self.signals.ui_settled.set();
    }

    pub async fn with_refresh_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        f().await
    }

    /// Pre-flight: make sure a reasonably fresh credential exists.
    ///
    /// A refresh that times out is not fatal here; the existing credential, stale or
    /// not, is still handed back.
    pub async fn ensure_credential(&self) -> Result<Arc<Credential>, GatewayError> {
        if !self.store.is_stale(self.policy.proactive_after) {
            return self.store.get().ok_or(GatewayError::NoCredential);
        }

        let seen = self.cycles_completed();
        self.with_refresh_lock(|| async {
            if let Some(outcome) = self.outcome_since(seen) {
                match outcome {
                    Ok(()) => tracing::debug!("Credentials refreshed while waiting"),
                    Err(e) => tracing::debug!("Refresh ran while waiting and failed: {}", e),
                }
                return;
            }
            if self.store.is_stale(self.policy.proactive_after) {
                match self.store.age() {
                    Some(age) => tracing::info!(
                        "Credentials are {} mins old; refreshing before request",
                        age.as_secs() / 60
                    ),
                    None => tracing::info!("No credentials yet; requesting a harvest"),
                }
                if let Err(e) = self.run_cycle(false).await {
                    tracing::warn!("Pre-flight refresh failed: {}", e);
                }
            }
        })
        .await;

        self.store.get().ok_or(GatewayError::NoCredential)
    }

    /// Mid-stream: the upstream rejected `failed`. Refresh unless someone already did.
    pub async fn refresh_after_auth_failure(
        &self,
        failed: &Arc<Credential>,
    ) -> Result<Arc<Credential>, GatewayError> {
        let seen = self.cycles_completed();
        self.with_refresh_lock(|| async {
            if let Some(current) = self.store.peek() {
                if !Arc::ptr_eq(&current, failed) {
                    tracing::info!("Credentials already refreshed by another request");
                    return Ok(current);
                }
            }
            // a sequence ran while we queued and still left the failed credential
            if let Some(Err(e)) = self.outcome_since(seen) {
                return Err(e);
            }

            self.run_cycle(true).await?;
            self.store.get().ok_or(GatewayError::NoCredential)
        })
        .await
    }

    pub fn spawn_keep_alive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.keep_alive(interval).await })
    }

    /// Refresh every `interval` so the harvester session never goes cold. Runs until aborted.
    pub async fn keep_alive(&self, interval: Duration) {
        tracing::info!("Keep-alive started (every {} mins)", interval.as_secs() / 60);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            tracing::info!("Keep-alive: refreshing credentials");
            let result = self.with_refresh_lock(|| self.run_cycle(false)).await;
            match result {
                Ok(()) => tracing::info!("Keep-alive refresh completed"),
                Err(e) => tracing::warn!("Keep-alive refresh failed: {}", e),
            }
        }
    }

    fn cycles_completed(&self) -> u64 {
        self.last_cycle.lock().completed
    }

    /// Outcome of the latest sequence, if one finished after `seen` was read
    fn outcome_since(&self, seen: u64) -> Option<Result<(), GatewayError>> {
        let record = self.last_cycle.lock();
        if record.completed == seen {
            return None;
        }
        Some(match record.timed_out {
            Some((what, waited)) => Err(GatewayError::RefreshTimeout { what, waited }),
            None => Ok(()),
        })
    }

    /// One refresh sequence. Caller must hold the refresh lock.
    async fn run_cycle(&self, wait_for_ui: bool) -> Result<(), GatewayError> {
        let result = self.attempt_cycle(wait_for_ui).await;
        let mut record = self.last_cycle.lock();
        record.completed += 1;
        record.timed_out = match &result {
            Err(GatewayError::RefreshTimeout { what, waited }) => Some((*what, *waited)),
            _ => None,
        };
        result
    }

    async fn attempt_cycle(&self, wait_for_ui: bool) -> Result<(), GatewayError> {
        // Arm before broadcasting so an instant reply is not lost
        self.signals.available.clear();
        if wait_for_ui {
            self.signals.ui_settled.clear();
        }

        self.request_refresh();

        if !self.wait_available(self.policy.credential_timeout).await {
            return Err(GatewayError::RefreshTimeout {
                what: "credentials",
                waited: self.policy.credential_timeout,
            });
        }

        if wait_for_ui && !self.await_ui_settled(self.policy.ui_settled_timeout).await {
            return Err(GatewayError::RefreshTimeout {
                what: "harvester to settle",
                waited: self.policy.ui_settled_timeout,
            });
        }

        tokio::time::sleep(self.policy.grace_delay).await;
        Ok(())
    }

    async fn wait_available(&self, timeout: Duration) -> bool {
        if self.signals.available.wait(timeout).await {
            return true;
        }
        tracing::warn!("Timed out after {}s waiting for credentials", timeout.as_secs());
        self.signals.ui_settled.set();
        false
    }
}
