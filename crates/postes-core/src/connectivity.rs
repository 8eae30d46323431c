//! Connectivity Monitor.
//!
//! The host platform's reachability signal is trusted as-is: whoever knows
//! about the network pushes it with [`ConnectivityMonitor::set_reachable`],
//! and consumers see only transitions. [`ReachabilityProbe`] is the push
//! source used by both binaries.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Regained,
    Lost,
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_reachable);
        Self { tx }
    }

    /// Record the current reachability. Returns the event if this was a
    /// transition; repeated reports of the same state are swallowed.
    pub fn set_reachable(&self, reachable: bool) -> Option<ConnectivityEvent> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
        if !changed {
            return None;
        }
        let event = if reachable {
            ConnectivityEvent::Regained
        } else {
            ConnectivityEvent::Lost
        };
        info!(?event, "connectivity changed");
        Some(event)
    }

    pub fn current(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ConnectivityEvents {
        let rx = self.tx.subscribe();
        let last = *rx.borrow();
        ConnectivityEvents { rx, last }
    }
}

#[async_trait]
impl Connectivity for ConnectivityMonitor {
    async fn is_reachable(&self) -> bool {
        self.current()
    }
}

/// Stream of reachability transitions.
pub struct ConnectivityEvents {
    rx: watch::Receiver<bool>,
    last: bool,
}

impl ConnectivityEvents {
    /// Wait for the next transition. `None` once the monitor is dropped.
    ///
    /// Intermediate flaps that happen between two calls collapse into the
    /// latest state; if that state equals the last one observed, nothing
    /// is reported.
    pub async fn next(&mut self) -> Option<ConnectivityEvent> {
        loop {
            self.rx.changed().await.ok()?;
            let now = *self.rx.borrow_and_update();
            if now != self.last {
                self.last = now;
                return Some(if now {
                    ConnectivityEvent::Regained
                } else {
                    ConnectivityEvent::Lost
                });
            }
        }
    }
}

/// Any HTTP answer from the API host counts as reachable, whatever its
/// status; only transport failures count as offline.
pub async fn check(client: &Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(response) => {
            debug!(status = %response.status(), "reachability check answered");
            true
        }
        Err(e) => {
            debug!(error = %e, "reachability check failed");
            false
        }
    }
}

/// Asks the API host whether it answers, once or on an interval.
pub struct ReachabilityProbe {
    client: Client,
    url: String,
    interval: Duration,
}

impl ReachabilityProbe {
    pub fn new(url: &str, timeout: Duration, interval: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            interval,
        })
    }

    pub async fn check(&self) -> bool {
        check(&self.client, &self.url).await
    }

    /// Poll forever, feeding each result into `monitor`.
    pub fn spawn(self, monitor: Arc<ConnectivityMonitor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                let reachable = self.check().await;
                monitor.set_reachable(reachable);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_only_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        assert_eq!(monitor.set_reachable(false), None);
        assert_eq!(monitor.set_reachable(true), Some(ConnectivityEvent::Regained));
        assert_eq!(monitor.set_reachable(true), None);
        assert!(monitor.is_reachable().await);
        assert_eq!(monitor.set_reachable(false), Some(ConnectivityEvent::Lost));
    }

    #[tokio::test]
    async fn subscribers_observe_regained() {
        let monitor = ConnectivityMonitor::new(false);
        let mut events = monitor.subscribe();
        monitor.set_reachable(true);
        assert_eq!(events.next().await, Some(ConnectivityEvent::Regained));
    }

    #[tokio::test]
    async fn events_end_when_monitor_dropped() {
        let monitor = ConnectivityMonitor::new(true);
        let mut events = monitor.subscribe();
        drop(monitor);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn any_status_means_reachable() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("HEAD", "/").with_status(503).create_async().await;

        let client = Client::new();
        assert!(check(&client, &server.url()).await);
    }

    #[tokio::test]
    async fn refused_connection_means_offline() {
        let probe = ReachabilityProbe::new("http://127.0.0.1:9", Duration::from_secs(2), Duration::from_secs(60)).unwrap();
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn spawned_probe_reports_regained() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("HEAD", "/").with_status(200).create_async().await;

        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let mut events = monitor.subscribe();
        let probe = ReachabilityProbe::new(&server.url(), Duration::from_secs(2), Duration::from_millis(10)).unwrap();
        let handle = probe.spawn(monitor.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap();
        assert_eq!(event, Some(ConnectivityEvent::Regained));
        handle.abort();
    }
}
