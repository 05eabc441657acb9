//! In-process dispatch seam.
//!
//! Outbox drains and saga timeout delivery both hand messages to handlers
//! through the [`Dispatcher`] trait. The dispatcher is deliberately thin: the
//! envelope carries the message type tag and serialized payload, and the
//! receiving side decodes it. A [`MessageTypeRegistry`] maps fully qualified
//! type tags to registered message types so timeout delivery can distinguish
//! "unknown type, never deliverable" from "dispatcher failed, retry next
//! pass".

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the in-process dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("No handler for message type '{0}'")]
    NoHandler(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Where a dispatched message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSource {
    /// Drained from the outbox by the publisher.
    Outbox,
    /// Delivered by the saga timeout loop.
    TimeoutDelivery,
    /// Handed in directly by application code.
    Direct,
}

/// Context travelling with a dispatched message.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Correlation id propagated from the producing operation.
    pub correlation_id: Option<String>,
    /// Origin of the dispatch.
    pub source: DispatchSource,
}

impl DispatchContext {
    /// Context for a direct application dispatch.
    pub fn direct() -> Self {
        Self {
            correlation_id: None,
            source: DispatchSource::Direct,
        }
    }

    /// Context for an outbox drain.
    pub fn outbox(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            source: DispatchSource::Outbox,
        }
    }

    /// Context for a timeout delivery.
    pub fn timeout_delivery(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            source: DispatchSource::TimeoutDelivery,
        }
    }
}

/// A message travelling through the in-process dispatcher.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Fully qualified message type tag.
    pub message_type: String,
    /// Serialized payload bytes.
    pub payload: Vec<u8>,
    /// Transport headers, when the message came off an outbox row.
    pub headers: HashMap<String, String>,
}

impl MessageEnvelope {
    /// Build an envelope.
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            headers: HashMap::new(),
        }
    }
}

/// In-process message bus.
///
/// Implementations route the envelope to whatever handler owns the message
/// type. Handler errors surface as [`DispatchError::Handler`] so callers can
/// record them without unwinding.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatch one envelope.
    async fn dispatch(
        &self,
        envelope: MessageEnvelope,
        context: DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

// ============================================================================
// Message Type Registry
// ============================================================================

/// A registered message type.
#[derive(Debug, Clone)]
pub struct RegisteredMessageType {
    /// Fully qualified type tag.
    pub name: String,
    /// Whether the type may be delivered to sagas (timeout delivery checks
    /// this before dispatching).
    pub saga_message: bool,
    /// Payload used when a stored timeout carries no payload.
    pub default_payload: Vec<u8>,
}

/// Maps fully qualified message type tags to registrations.
///
/// Re-registration under the same tag replaces the prior entry.
#[derive(Default)]
pub struct MessageTypeRegistry {
    types: RwLock<HashMap<String, RegisteredMessageType>>,
}

impl MessageTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a saga-capable message type with an empty-object default
    /// payload.
    pub async fn register_saga_message(&self, name: impl Into<String>) {
        self.register(RegisteredMessageType {
            name: name.into(),
            saga_message: true,
            default_payload: b"{}".to_vec(),
        })
        .await;
    }

    /// Register a message type.
    pub async fn register(&self, entry: RegisteredMessageType) {
        let name = entry.name.clone();
        let mut types = self.types.write().await;
        types.insert(name.clone(), entry);
        info!(message_type = %name, "Message type registered");
    }

    /// Resolve a registration by tag.
    pub async fn resolve(&self, name: &str) -> Option<RegisteredMessageType> {
        let types = self.types.read().await;
        types.get(name).cloned()
    }
}

// ============================================================================
// Mock
// ============================================================================

/// A dispatch recorded by the mock dispatcher.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    /// Envelope that was dispatched.
    pub envelope: MessageEnvelope,
    /// Context the envelope travelled with.
    pub context: DispatchContext,
}

/// Recording dispatcher for tests.
#[derive(Default)]
pub struct MockDispatcher {
    dispatches: Mutex<Vec<RecordedDispatch>>,
    fail_with: Mutex<Option<String>>,
}

impl MockDispatcher {
    /// Create a mock that accepts every dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent dispatches fail with a handler error.
    pub async fn set_fail_with(&self, error: impl Into<String>) {
        *self.fail_with.lock().await = Some(error.into());
    }

    /// Restore successful dispatches.
    pub async fn clear_failure(&self) {
        *self.fail_with.lock().await = None;
    }

    /// Number of recorded dispatches.
    pub async fn dispatched_count(&self) -> usize {
        self.dispatches.lock().await.len()
    }

    /// Snapshot of recorded dispatches in order.
    pub async fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.dispatches.lock().await.clone()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        envelope: MessageEnvelope,
        context: DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if let Some(error) = self.fail_with.lock().await.clone() {
            return Err(DispatchError::Handler(error));
        }
        self.dispatches
            .lock()
            .await
            .push(RecordedDispatch { envelope, context });
        Ok(())
    }
}
