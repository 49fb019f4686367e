//! Sync polling loop and Channel trait implementation.

use super::dedup::{is_stale, SeenMessages};
use super::normalize::normalize;
use super::types::{status_error, sync_events, transport_error, ApiEnvelope, SyncRequest};
use super::Wx849Channel;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wxrelay_core::{
    error::{RelayError, TransportError},
    message::{DeliveryReceipt, Message},
    traits::Channel,
};

/// Consecutive poll failures before the heartbeat check runs.
pub(crate) const RECONNECT_AFTER: u32 = 5;
pub(super) const BACKOFF_START: Duration = Duration::from_secs(1);
pub(super) const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[async_trait]
impl Channel for Wx849Channel {
    fn name(&self) -> &str {
        "wx849"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Message>, RelayError> {
        if self.config.wxid.is_empty() {
            return Err(RelayError::Channel("wx849: bot wxid not configured".into()));
        }

        let (tx, rx) = mpsc::channel(64);
        let poller = Poller {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            wxid: self.config.wxid.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            request_timeout: Duration::from_secs(self.config.request_timeout_secs),
            max_age_secs: self.config.max_message_age_secs,
            seen: SeenMessages::new(Duration::from_secs(self.config.dedup_window_secs)),
            backoff: Backoff::new(self.backoff_start, self.backoff_cap),
        };

        info!("wx849 channel polling {}", self.base_url);
        let handle = tokio::spawn(poller.run(tx));
        if let Some(previous) = self.poll_task.lock().await.replace(handle) {
            previous.abort();
        }

        Ok(rx)
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError> {
        self.send_text(chat_id, text).await
    }

    async fn is_available(&self) -> bool {
        heartbeat(
            &self.client,
            &self.base_url,
            &self.config.wxid,
            Duration::from_secs(self.config.request_timeout_secs),
        )
        .await
        .is_ok()
    }

    async fn stop(&self) -> Result<(), RelayError> {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
            info!("wx849 channel stopped");
        }
        Ok(())
    }
}

/// State owned by the listening task.
struct Poller {
    client: reqwest::Client,
    base_url: String,
    wxid: String,
    poll_interval: Duration,
    request_timeout: Duration,
    max_age_secs: u64,
    seen: SeenMessages,
    backoff: Backoff,
}

impl Poller {
    async fn run(mut self, tx: mpsc::Sender<Message>) {
        let mut failures: u32 = 0;

        while !tx.is_closed() {
            let events = match self.poll_once().await {
                Ok(events) => events,
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.next_delay();
                    warn!("wx849 poll error ({failures} in a row, retry in {delay:?}): {e}");
                    if failures % RECONNECT_AFTER == 0 {
                        self.reconnect(failures).await;
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            if failures > 0 {
                info!("wx849 poll recovered after {failures} failures");
            }
            failures = 0;
            self.backoff.reset();

            let now = chrono::Utc::now();
            for raw in events {
                let Some(msg) = self.accept(&raw, now) else {
                    continue;
                };
                // Awaits capacity: events already acknowledged by the service
                // must not be dropped.
                if tx.send(msg).await.is_err() {
                    info!("wx849 channel receiver dropped, stopping poll");
                    return;
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
        info!("wx849 channel receiver dropped, stopping poll");
    }

    async fn poll_once(&self) -> Result<Vec<Value>, TransportError> {
        let url = format!("{}/Msg/Sync", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&SyncRequest {
                wxid: &self.wxid,
                scene: 0,
                synckey: "",
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let envelope: ApiEnvelope = resp.json().await.map_err(transport_error)?;
        Ok(sync_events(envelope.into_data()?))
    }

    /// Normalize one event and apply self, replay, and duplicate filters.
    fn accept(&mut self, raw: &Value, now: chrono::DateTime<chrono::Utc>) -> Option<Message> {
        let msg = normalize(raw, now);

        if msg.conversation.sender_id == self.wxid {
            debug!("wx849: skipping own message {}", msg.id);
            return None;
        }
        if is_stale(msg.timestamp, now, self.max_age_secs) {
            debug!("wx849: skipping stale message {} from {}", msg.id, msg.timestamp);
            return None;
        }
        if !self.seen.insert(&msg.id) {
            debug!("wx849: skipping duplicate message {}", msg.id);
            return None;
        }

        debug!(
            "wx849: {} from {} in {}: {}",
            msg.kind(),
            msg.conversation.sender_id,
            msg.conversation.chat_id,
            msg.preview()
        );
        Some(msg)
    }

    async fn reconnect(&self, failures: u32) {
        warn!("wx849: {failures} consecutive poll failures, checking protocol service heartbeat");
        match heartbeat(&self.client, &self.base_url, &self.wxid, self.request_timeout).await {
            Ok(()) => info!("wx849: protocol service answered heartbeat, resuming poll"),
            Err(e) => error!("wx849: protocol service heartbeat failed: {e}"),
        }
    }
}

/// `GET Login/HeartBeat`: succeeds when the service reports the account online.
pub(crate) async fn heartbeat(
    client: &reqwest::Client,
    base_url: &str,
    wxid: &str,
    timeout: Duration,
) -> Result<(), TransportError> {
    let url = format!("{base_url}/Login/HeartBeat");
    let resp = client
        .get(&url)
        .query(&[("wxid", wxid)])
        .timeout(timeout)
        .send()
        .await
        .map_err(transport_error)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    let envelope: ApiEnvelope = resp.json().await.map_err(transport_error)?;
    envelope.into_data().map(|_| ())
}

/// Exponential backoff with ±25% jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    start: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self {
            start,
            cap,
            current: start,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = self.current.mul_f64(jitter);
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.start;
    }
}
