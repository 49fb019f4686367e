//! wx849 protocol service channel.
//!
//! Polls `Msg/Sync` for new events and answers through `Msg/SendTxt`.
//! The service wraps every response in a `{Success, Code, Message, Data}`
//! envelope.

mod dedup;
pub mod normalize;
mod polling;
pub(crate) mod send;
pub(crate) mod types;


pub use normalize::normalize;
pub use send::strip_markdown;

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use wxrelay_core::config::ProtocolConfig;

/// wx849 channel using HTTP polling against the protocol service.
pub struct Wx849Channel {
    config: ProtocolConfig,
    client: reqwest::Client,
    base_url: String,
    /// Delay after the first failed poll; doubles up to `backoff_cap`.
    backoff_start: Duration,
    backoff_cap: Duration,
    /// Listening loop, present while started.
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Wx849Channel {
    /// Create a new channel from config.
    pub fn new(config: ProtocolConfig) -> Self {
        let base_url = config.base_url();
        Self {
            config,
            client: reqwest::Client::new(),
            base_url,
            backoff_start: polling::BACKOFF_START,
            backoff_cap: polling::BACKOFF_CAP,
            poll_task: Mutex::new(None),
        }
    }

    /// Point the channel at a different API root (including the prefix).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the poll failure backoff.
    pub fn with_backoff(mut self, start: Duration, cap: Duration) -> Self {
        self.backoff_start = start;
        self.backoff_cap = cap;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
