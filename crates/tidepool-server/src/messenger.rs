//! Message delivery contract

use crate::error::Result;
use crate::messages::ProtocolMessage;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Delivers protocol messages to connections. Implemented by the
/// transport adapter (websocket fan-out, message queue, etc.).
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends `message` to every listed connection, skipping
    /// `exclude_connection` if it appears in the list.
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: ProtocolMessage,
        exclude_connection: Option<&str>,
    ) -> Result<()>;
}

/// One recorded delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Recipients after exclusion was applied.
    pub connection_ids: Vec<String>,
    pub message: ProtocolMessage,
}

/// In-memory messenger that records every delivery. Backs tests and
/// embedded single-process setups where the caller drains the log.
pub struct MemoryMessenger {
    sent: Mutex<Vec<SentMessage>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// All deliveries so far, in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Deliveries addressed to one connection.
    pub fn sent_to(&self, connection_id: &str) -> Vec<ProtocolMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.connection_ids.iter().any(|id| id == connection_id))
            .map(|s| s.message.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Default for MemoryMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: ProtocolMessage,
        exclude_connection: Option<&str>,
    ) -> Result<()> {
        let recipients: Vec<String> = connection_ids
            .iter()
            .filter(|id| Some(id.as_str()) != exclude_connection)
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }
        self.sent.lock().push(SentMessage {
            connection_ids: recipients,
            message,
        });
        Ok(())
    }
}
