use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Checks that the backend answers, not just that a link is up
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Process-lifetime view of connectivity.
///
/// Platform signals call `set_online`; an optional probe task keeps the value
/// honest when the link is up but the backend is not.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity signal. Returns true on an offline to online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed && online {
            info!("network: online");
        } else if changed {
            warn!("network: offline");
        }
        changed && online
    }

    /// Stream of reconnect events
    pub fn subscribe(&self) -> ReconnectEvents {
        ReconnectEvents {
            rx: self.state.subscribe(),
        }
    }

    /// Every change, in both directions
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Poll `probe` every `interval` and feed the result into the monitor
    pub fn spawn_probe(&self, probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reachable = probe.is_reachable().await;
                monitor.set_online(reachable);
            }
        })
    }
}

pub struct ReconnectEvents {
    rx: watch::Receiver<bool>,
}

impl ReconnectEvents {
    /// Wait for the next offline to online transition. None once the monitor is gone.
    pub async fn recv(&mut self) -> Option<()> {
        loop {
            self.rx.changed().await.ok()?;
            if *self.rx.borrow_and_update() {
                return Some(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_set_online_reports_transitions() {
        let monitor = NetworkMonitor::new(false);
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(!monitor.set_online(false));
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_reconnect_event_fires_on_transition_only() {
        let monitor = NetworkMonitor::new(true);
        let mut events = monitor.subscribe();

        monitor.set_online(false);
        monitor.set_online(true);
        let got = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(got.unwrap(), Some(()));

        monitor.set_online(false);
        let nothing = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(nothing.is_err());
    }

    struct Flag(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for Flag {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_probe_overrides_link_state() {
        let monitor = NetworkMonitor::new(true);
        let probe = Arc::new(Flag(AtomicBool::new(false)));
        let mut changes = monitor.watch();
        let mut events = monitor.subscribe();
        let handle = monitor.spawn_probe(probe.clone(), Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!monitor.is_online());

        probe.0.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert!(monitor.is_online());
        handle.abort();
    }
}
