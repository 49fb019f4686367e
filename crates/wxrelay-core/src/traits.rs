use crate::{
    error::{BackendError, RelayError, TransportError},
    message::{ConverseRequest, DeliveryReceipt, Message, Reply},
};
use async_trait::async_trait;

/// AI backend trait: the brain.
///
/// Every conversational API the relay can talk to implements this trait
/// to provide a uniform request/response interface.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Send one conversational turn and wait for the full reply.
    async fn converse(&self, request: &ConverseRequest) -> Result<Reply, BackendError>;

    /// Check if the backend is reachable and configured.
    async fn is_available(&self) -> bool;
}

/// Messaging channel trait: the protocol service adapter.
///
/// The receiver returned by `start` yields normalized inbound messages;
/// `recv().await` blocks until the next one arrives.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start the listening loop.
    async fn start(&self) -> Result<tokio::sync::mpsc::Receiver<Message>, RelayError>;

    /// Deliver a text message to a chat. Must be safe to call concurrently.
    async fn send(&self, chat_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError>;

    /// Check if the protocol service is up.
    async fn is_available(&self) -> bool {
        true
    }

    /// Graceful shutdown.
    async fn stop(&self) -> Result<(), RelayError>;
}
