//! services/api/src/adapters/connectivity_probe.rs
//!
//! Feeds the `ConnectivityMonitor` by periodically reaching for the provider.
//! Any HTTP answer counts as online; only transport failures count as offline.

use session_reliability_core::ConnectivityMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub struct ConnectivityProbe {
    client: reqwest::Client,
    target: Url,
    monitor: Arc<ConnectivityMonitor>,
}

impl ConnectivityProbe {
    pub fn new(target: Url, monitor: Arc<ConnectivityMonitor>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            target,
            monitor,
        })
    }

    /// Probes once and publishes the result. Returns whether we are online.
    pub async fn probe(&self) -> bool {
        let online = match self.client.head(self.target.clone()).send().await {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "connectivity probe answered");
                true
            }
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        };
        let was_online = self.monitor.is_online();
        if online != was_online {
            if online {
                info!(url = %self.target, "connectivity restored");
            } else {
                warn!(url = %self.target, "connectivity lost");
            }
        }
        self.monitor.set_online(online);
        online
    }

    /// Probes every `every` until `token` is cancelled.
    pub fn spawn(self, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe().await;
                    }
                }
            }
            debug!("connectivity probe stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn any_http_answer_means_online() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let probe = ConnectivityProbe::new(
            Url::parse(&server.uri()).unwrap(),
            monitor.clone(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(probe.probe().await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn unreachable_target_means_offline() {
        let server = MockServer::start().await;
        let target = Url::parse(&server.uri()).unwrap();
        drop(server);

        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let probe = ConnectivityProbe::new(target, monitor.clone(), Duration::from_secs(2)).unwrap();
        assert!(!probe.probe().await);
        assert!(!monitor.is_online());
    }
}
