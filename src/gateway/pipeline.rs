//! Message processing pipeline: one admitted message from session lookup
//! to reply delivery.

use super::Gateway;
use crate::commands::{self, Command, CommandContext};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use wxrelay_core::{
    admission::Admitted,
    error::BackendError,
    message::{ConversationId, ConverseRequest},
};
use wxrelay_memory::{
    audit::{AuditEntry, AuditStatus},
    PendingRequest, SessionStore,
};

/// Where an exchange is. `Done` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stage {
    Received,
    SessionResolved,
    InFlight,
    AwaitingAiResponse,
    Replying,
    Done,
    Errored(Failure),
}

/// Why an exchange ended in `Errored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Failure {
    /// The session store could not be read or written.
    Session,
    /// Another exchange already holds the conversation.
    Busy,
    /// Too many messages were already waiting for a worker.
    Overloaded,
    Timeout,
    Backend,
    DeliveryFailed,
}

/// Tracks and logs stage transitions for one message.
struct Progress {
    message_id: String,
    stage: Stage,
}

impl Progress {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, next: Stage) -> Stage {
        debug!("message {}: {:?} -> {:?}", self.message_id, self.stage, next);
        self.stage = next;
        next
    }
}

/// A conversation's in-flight claim, held for the length of one exchange.
///
/// `finish` and `release` hand the claim back. If the holder unwinds or is
/// aborted before that, dropping the claim releases it in the background.
struct Claim {
    store: SessionStore,
    pending: Option<PendingRequest>,
}

impl Claim {
    fn new(store: SessionStore, pending: PendingRequest) -> Self {
        Self {
            store,
            pending: Some(pending),
        }
    }

    /// Record the exchange's history reference and release the claim.
    async fn finish(mut self, history_ref: Option<&str>) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        match self.store.complete(&pending, history_ref).await {
            Ok(true) => {}
            Ok(false) => debug!(
                "{}: claim was taken over before the exchange finished",
                pending.conversation_key
            ),
            Err(e) => {
                warn!(
                    "failed to record exchange for {}: {e}",
                    pending.conversation_key
                );
                release(&self.store, &pending).await;
            }
        }
        self.pending = None;
    }

    async fn release(mut self) {
        if let Some(pending) = self.pending.clone() {
            release(&self.store, &pending).await;
            self.pending = None;
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        warn!(
            "exchange for {} ended without releasing its claim",
            pending.conversation_key
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move { release(&store, &pending).await });
        }
    }
}

async fn release(store: &SessionStore, pending: &PendingRequest) {
    if let Err(e) = store.clear_in_flight(pending).await {
        warn!(
            "failed to release in-flight flag for {}: {e}",
            pending.conversation_key
        );
    }
}

impl Gateway {
    /// Process one admitted message through the full pipeline.
    pub(super) async fn handle_admitted(&self, admitted: Admitted) -> Stage {
        let prompt = admitted.prompt();
        let Admitted { message, text } = admitted;
        let conversation = &message.conversation;
        let key = self.store.key_for(conversation);
        let started = Instant::now();
        let mut progress = Progress::new(&message.id);

        info!(
            "[{}] {} says: {}",
            self.channel.name(),
            conversation.sender_id,
            message.preview()
        );

        // --- 1. COMMANDS ---
        if let Some(cmd) = Command::parse(&text) {
            let input = cmd.audit_text(&text);
            let ctx = CommandContext {
                store: &self.store,
                conversation,
                personas: &self.personas,
                admin_secret: &self.admin_secret,
                notices: &self.notices,
            };
            let response = commands::handle(cmd, &ctx).await;

            progress.advance(Stage::Replying);
            let delivered = self.send_text(conversation, &response).await;
            self.write_audit(AuditEntry {
                output_text: Some(response),
                status: AuditStatus::Command,
                error: (!delivered).then(|| "delivery failed".to_string()),
                ..self.audit_base(&key, conversation, &input, started)
            })
            .await;
            return progress.advance(if delivered {
                Stage::Done
            } else {
                Stage::Errored(Failure::DeliveryFailed)
            });
        }

        // --- 2. SESSION ---
        let context = match self.store.get_or_create(conversation).await {
            Ok(context) => context,
            Err(e) => {
                error!("session lookup failed for {key}: {e}");
                return self
                    .fail_early(&mut progress, &key, conversation, &text, started, e.to_string())
                    .await;
            }
        };
        progress.advance(Stage::SessionResolved);

        // --- 3. IN-FLIGHT GUARD ---
        let pending = match self.store.try_set_in_flight(&key).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                info!("{key} is busy, rejecting message {}", message.id);
                self.send_text(conversation, &self.notices.busy).await;
                self.write_audit(AuditEntry {
                    output_text: Some(self.notices.busy.clone()),
                    status: AuditStatus::Busy,
                    ..self.audit_base(&key, conversation, &text, started)
                })
                .await;
                return progress.advance(Stage::Errored(Failure::Busy));
            }
            Err(e) => {
                error!("in-flight claim failed for {key}: {e}");
                return self
                    .fail_early(&mut progress, &key, conversation, &text, started, e.to_string())
                    .await;
            }
        };
        let claim = Claim::new(self.store.clone(), pending);
        progress.advance(Stage::InFlight);

        // --- 4. BACKEND EXCHANGE ---
        // Only claimed conversations wait here, so busy ones were already told.
        let Ok(_worker) = self.workers.clone().acquire_owned().await else {
            claim.release().await;
            return progress.advance(Stage::Errored(Failure::Backend));
        };
        let request = ConverseRequest {
            conversation_key: key.clone(),
            user: key.clone(),
            text: prompt,
            persona: context.persona.clone(),
            history_ref: context.history_ref.clone(),
        };
        progress.advance(Stage::AwaitingAiResponse);
        let result =
            match tokio::time::timeout(self.backend_timeout, self.backend.converse(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout),
            };

        let reply = match result {
            Ok(reply) => {
                claim.finish(reply.history_ref.as_deref()).await;
                reply
            }
            Err(e) => {
                claim.release().await;
                if e.is_fatal() {
                    error!("backend {} refused credentials: {e}", self.backend.name());
                    self.fatal.send_replace(Some(e.to_string()));
                } else {
                    warn!("backend error for {key}: {e}");
                }

                let (notice, failure) = match &e {
                    BackendError::Timeout => (&self.notices.timeout, Failure::Timeout),
                    BackendError::RateLimited { .. } => {
                        (&self.notices.rate_limited, Failure::Backend)
                    }
                    _ => (&self.notices.error, Failure::Backend),
                };
                self.send_text(conversation, notice).await;
                self.write_audit(AuditEntry {
                    output_text: Some(notice.clone()),
                    backend: Some(self.backend.name().to_string()),
                    status: AuditStatus::Error,
                    error: Some(e.to_string()),
                    ..self.audit_base(&key, conversation, &text, started)
                })
                .await;
                return progress.advance(Stage::Errored(failure));
            }
        };

        // --- 5. REPLY ---
        progress.advance(Stage::Replying);
        let delivered = self.send_text(conversation, &reply.text).await;
        info!(
            "[{}] replied to {key} in {}ms (backend {}ms)",
            self.channel.name(),
            started.elapsed().as_millis(),
            reply.latency_ms
        );

        self.write_audit(AuditEntry {
            output_text: Some(reply.text.clone()),
            backend: Some(self.backend.name().to_string()),
            model: reply.model.clone(),
            status: if delivered {
                AuditStatus::Ok
            } else {
                AuditStatus::Error
            },
            error: (!delivered).then(|| "delivery failed".to_string()),
            ..self.audit_base(&key, conversation, &text, started)
        })
        .await;

        progress.advance(if delivered {
            Stage::Done
        } else {
            Stage::Errored(Failure::DeliveryFailed)
        })
    }

    /// Store failure before the backend was reached: notify and audit.
    async fn fail_early(
        &self,
        progress: &mut Progress,
        key: &str,
        conversation: &ConversationId,
        text: &str,
        started: Instant,
        reason: String,
    ) -> Stage {
        self.send_text(conversation, &self.notices.error).await;
        self.write_audit(AuditEntry {
            output_text: Some(self.notices.error.clone()),
            status: AuditStatus::Error,
            error: Some(reason),
            ..self.audit_base(key, conversation, text, started)
        })
        .await;
        progress.advance(Stage::Errored(Failure::Session))
    }

    /// Answer a message that found no room in the pending bound.
    pub(super) async fn turn_away(&self, admitted: Admitted) -> Stage {
        let Admitted { message, text } = admitted;
        let conversation = &message.conversation;
        let key = self.store.key_for(conversation);
        let started = Instant::now();
        let mut progress = Progress::new(&message.id);

        self.send_text(conversation, &self.notices.overloaded).await;
        self.write_audit(AuditEntry {
            output_text: Some(self.notices.overloaded.clone()),
            status: AuditStatus::Busy,
            error: Some("too many pending messages".to_string()),
            ..self.audit_base(&key, conversation, &text, started)
        })
        .await;
        progress.advance(Stage::Errored(Failure::Overloaded))
    }

    fn audit_base(
        &self,
        key: &str,
        conversation: &ConversationId,
        input: &str,
        started: Instant,
    ) -> AuditEntry {
        AuditEntry {
            channel: self.channel.name().to_string(),
            conversation_key: key.to_string(),
            sender_id: conversation.sender_id.clone(),
            input_text: input.to_string(),
            output_text: None,
            backend: None,
            model: None,
            processing_ms: Some(started.elapsed().as_millis() as i64),
            status: AuditStatus::Ok,
            error: None,
        }
    }

    async fn write_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.log(&entry).await {
            warn!("audit log failed: {e}");
        }
    }
}
