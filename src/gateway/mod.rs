//! Gateway: the main event loop connecting the protocol channel, the
//! session store, and the AI backend.
//!
//! Admission runs inline on the intake loop; every admitted message is
//! handled on its own task. At most `dispatch.max_pending` messages are
//! held at once, and at most `dispatch.max_workers` of them talk to the
//! backend. A conversation is claimed before waiting for a worker, so a
//! busy conversation is answered right away even when all workers are taken.

mod pipeline;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use wxrelay_core::{
    admission::AdmissionFilter,
    config::{Config, DispatchConfig, Notices, SessionConfig},
    message::{ConversationId, Message},
    traits::{Backend, Channel},
};
use wxrelay_memory::{AuditLogger, SessionStore};

/// How long shutdown waits for running exchanges before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Added to the backend timeout to get the age of an abandoned claim.
const CLAIM_MARGIN: Duration = Duration::from_secs(30);

/// The central gateway that routes messages between the channel and the backend.
pub struct Gateway {
    pub(super) channel: Arc<dyn Channel>,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) store: SessionStore,
    pub(super) audit: AuditLogger,
    pub(super) filter: AdmissionFilter,
    pub(super) personas: BTreeMap<String, String>,
    pub(super) notices: Notices,
    /// Empty disables admin mode.
    pub(super) admin_secret: String,
    pub(super) dispatch: DispatchConfig,
    pub(super) session_config: SessionConfig,
    /// Upper bound for one backend exchange.
    pub(super) backend_timeout: Duration,
    /// Permits for backend exchanges.
    pub(super) workers: Arc<Semaphore>,
    /// Permits for admitted messages being handled or waiting for a worker.
    pub(super) pending: Arc<Semaphore>,
    /// Set once by a worker that hits a process-fatal backend error.
    pub(super) fatal: watch::Sender<Option<String>>,
}

impl Gateway {
    /// Create a new gateway.
    pub fn new(
        config: &Config,
        channel: Arc<dyn Channel>,
        backend: Arc<dyn Backend>,
        store: SessionStore,
    ) -> Self {
        let audit = AuditLogger::new(store.pool().clone());
        let (fatal, _) = watch::channel(None);
        let backend_timeout = Duration::from_secs(config.backend.timeout_secs);
        let max_workers = config.dispatch.max_workers.max(1);
        Self {
            channel,
            backend,
            store: store.with_claim_timeout(backend_timeout + CLAIM_MARGIN),
            audit,
            filter: AdmissionFilter::new(&config.filter).with_self_id(&config.protocol.wxid),
            personas: config.personas.clone(),
            notices: config.notices.clone(),
            admin_secret: config.admin.secret.clone(),
            dispatch: config.dispatch.clone(),
            session_config: config.session.clone(),
            backend_timeout,
            workers: Arc::new(Semaphore::new(max_workers)),
            pending: Arc::new(Semaphore::new(config.dispatch.max_pending.max(max_workers))),
            fatal,
        }
    }

    /// Run the main event loop until the channel closes, Ctrl-C arrives,
    /// or a worker raises a fatal error.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            "wxrelay gateway running | channel: {} | backend: {} | workers: {}",
            self.channel.name(),
            self.backend.name(),
            self.dispatch.max_workers,
        );

        self.store.release_stale_in_flight().await?;

        let mut rx = self
            .channel
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("failed to start channel {}: {e}", self.channel.name()))?;
        info!("Channel started: {}", self.channel.name());

        let sweeper = self.spawn_sweeper();
        let mut fatal_rx = self.fatal.subscribe();
        let mut tasks = JoinSet::new();

        // Main event loop with graceful shutdown.
        let outcome = loop {
            tokio::select! {
                incoming = rx.recv() => match incoming {
                    Some(message) => self.intake(message, &mut tasks),
                    None => {
                        info!("channel closed, stopping intake");
                        break Ok(());
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("exchange task panicked: {e}");
                        }
                    }
                }
                changed = fatal_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let reason = fatal_rx.borrow_and_update().clone();
                    if let Some(reason) = reason {
                        error!("fatal backend error, stopping: {reason}");
                        break Err(anyhow::anyhow!("fatal backend error: {reason}"));
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
            }
        };

        self.shutdown(sweeper, tasks).await;
        outcome
    }

    /// Admit a message and hand it to a worker task.
    fn intake(self: &Arc<Self>, message: Message, tasks: &mut JoinSet<()>) {
        let id = message.id.clone();
        let admitted = match self.filter.admit(message) {
            Ok(admitted) => admitted,
            Err(reason) => {
                debug!("message {id} rejected: {reason}");
                return;
            }
        };

        let gw = Arc::clone(self);
        match self.pending.clone().try_acquire_owned() {
            Ok(slot) => {
                tasks.spawn(async move {
                    let _slot = slot;
                    gw.handle_admitted(admitted).await;
                });
            }
            Err(_) => {
                warn!("{} messages pending, turning away {id}", self.dispatch.max_pending);
                tasks.spawn(async move {
                    gw.turn_away(admitted).await;
                });
            }
        }
    }

    /// Periodically evict idle conversations.
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.session_config.idle_ttl_secs;
        let every = Duration::from_secs(self.session_config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = store.evict_idle(ttl).await {
                    warn!("idle sweep failed: {e}");
                }
            }
        })
    }

    /// Graceful shutdown: stop the sweeper, let running exchanges finish,
    /// stop the channel.
    async fn shutdown(&self, sweeper: JoinHandle<()>, mut tasks: JoinSet<()>) {
        info!("Shutting down...");
        sweeper.abort();

        if !tasks.is_empty() {
            info!("waiting for {} running exchange(s)", tasks.len());
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("aborting {} exchange(s) still running", tasks.len());
                tasks.abort_all();
            }
        }

        if let Err(e) = self.channel.stop().await {
            warn!("failed to stop channel {}: {e}", self.channel.name());
        }

        info!("Shutdown complete.");
    }

    /// Send text back to a conversation. Group replies may mention the sender.
    ///
    /// Returns whether the protocol service accepted the message.
    pub(super) async fn send_text(&self, conversation: &ConversationId, text: &str) -> bool {
        let text = if conversation.is_group && self.dispatch.group_reply_mention {
            format!("@{} {text}", conversation.sender_id)
        } else {
            text.to_string()
        };

        match self.channel.send(&conversation.chat_id, &text).await {
            Ok(receipt) => {
                debug!(
                    "delivered to {} after {} attempt(s)",
                    conversation.chat_id, receipt.attempts
                );
                true
            }
            Err(e) => {
                error!("failed to deliver to {}: {e}", conversation.chat_id);
                false
            }
        }
    }
}
