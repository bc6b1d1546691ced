//! Online/offline state shared by the workflows, the sync engine and the
//! status indicator.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::RemoteBackend;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publish a new state. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Probe backend health every `interval` and publish transitions until
    /// `cancel` fires.
    pub fn spawn_probe(
        &self,
        remote: Arc<dyn RemoteBackend>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let healthy = remote.health().await;
                        this.set_online(healthy);
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity").field("online", &self.is_online()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    #[test]
    fn test_set_online_reports_transitions_only() {
        let c = Connectivity::new(false);
        assert!(!c.set_online(false));
        assert!(c.set_online(true));
        assert!(c.is_online());
        assert!(!c.set_online(true));
    }

    #[tokio::test]
    async fn test_health_check_publishes_backend_state() {
        let remote = Arc::new(MemoryBackend::new());
        let c = Connectivity::new(false);
        let mut rx = c.subscribe();
        let cancel = CancellationToken::new();
        let handle = c.spawn_probe(remote.clone(), Duration::from_millis(10), cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| *online))
            .await
            .unwrap()
            .unwrap();

        remote.set_offline(true);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| !*online))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}
