//! Transport adapter seam and registry.
//!
//! The core never talks to a broker directly. Concrete clients (AMQP, Kafka,
//! SQS, ...) live behind [`TransportAdapter`]; the publisher resolves them by
//! name through a [`TransportRegistry`] at dispatch time. A recording
//! [`MockTransportAdapter`] is provided for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::outbox::OutboundMessage;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by transport adapters.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport '{0}' is not registered")]
    NotRegistered(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Sends one outbound message to one destination.
///
/// Implementations throw on transport failure; the publisher records the
/// outcome on the outbox row and owns the retry budget.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Deliver `message` to `destination`.
    async fn send(
        &self,
        message: &OutboundMessage,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Named registration of a transport adapter.
#[derive(Clone)]
struct TransportRegistration {
    adapter: Arc<dyn TransportAdapter>,
    display_name: String,
}

/// Registry of named transport adapters.
///
/// Registration replaces any prior adapter under the same name.
#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<HashMap<String, TransportRegistration>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `name`.
    pub async fn register(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn TransportAdapter>,
        display_name: impl Into<String>,
    ) {
        let name = name.into();
        let display_name = display_name.into();
        let mut transports = self.transports.write().await;
        transports.insert(
            name.clone(),
            TransportRegistration {
                adapter,
                display_name: display_name.clone(),
            },
        );
        info!(transport = %name, display_name = %display_name, "Transport registered");
    }

    /// Resolve an adapter by name.
    pub async fn resolve(&self, name: &str) -> Option<Arc<dyn TransportAdapter>> {
        let transports = self.transports.read().await;
        transports.get(name).map(|r| r.adapter.clone())
    }

    /// Human-readable name for a registered transport.
    pub async fn display_name(&self, name: &str) -> Option<String> {
        let transports = self.transports.read().await;
        transports.get(name).map(|r| r.display_name.clone())
    }

    /// Names of all registered transports.
    pub async fn names(&self) -> Vec<String> {
        let transports = self.transports.read().await;
        let mut names: Vec<String> = transports.keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Recorded send call on the mock transport.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    /// Id of the sent message.
    pub message_id: String,
    /// Destination the message was sent to.
    pub destination: String,
}

/// In-memory transport for tests.
///
/// Records every successful send and can be told to fail.
#[derive(Default)]
pub struct MockTransportAdapter {
    sends: Mutex<Vec<RecordedSend>>,
    fail_with: Mutex<Option<String>>,
}

impl MockTransportAdapter {
    /// Create a mock that accepts every send.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `error`.
    pub async fn set_fail_with(&self, error: impl Into<String>) {
        *self.fail_with.lock().await = Some(error.into());
    }

    /// Restore successful sends.
    pub async fn clear_failure(&self) {
        *self.fail_with.lock().await = None;
    }

    /// Number of recorded sends.
    pub async fn sent_count(&self) -> usize {
        self.sends.lock().await.len()
    }

    /// Snapshot of recorded sends in order.
    pub async fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().await.clone()
    }
}

#[async_trait]
impl TransportAdapter for MockTransportAdapter {
    async fn send(
        &self,
        message: &OutboundMessage,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Some(error) = self.fail_with.lock().await.clone() {
            return Err(TransportError::Send(error));
        }
        self.sends.lock().await.push(RecordedSend {
            message_id: message.id.clone(),
            destination: destination.to_string(),
        });
        Ok(())
    }
}
