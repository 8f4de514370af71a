//! Kind-keyed delivery of inbound messages.
//!
//! The transport hands every received buffer to [`MessageDispatcher::deliver`],
//! which peeks the header and calls the handler registered for that kind.
//! Buffers with no handler are logged and dropped.

use crate::message::{Header, MessageKind};
use airwave_env::Rank;
use std::collections::HashMap;
use tracing::{trace, warn};

/// Callback for one message kind: `(bytes, source_rank)`.
pub type MessageHandler = Box<dyn FnMut(&[u8], Rank) + Send>;

/// What happened to a delivered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled(MessageKind),
    /// Known kind, nobody listening
    Unhandled(MessageKind),
    UnknownKind(u32),
    Malformed,
}

#[derive(Default)]
pub struct MessageDispatcher {
    handlers: HashMap<MessageKind, MessageHandler>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn on_message<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&[u8], Rank) + Send + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Registers the same handler for several kinds.
    pub fn on_messages<F>(&mut self, kinds: &[MessageKind], handler: F)
    where
        F: FnMut(&[u8], Rank) + Send + Clone + 'static,
    {
        for kind in kinds {
            self.on_message(*kind, handler.clone());
        }
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn deliver(&mut self, bytes: &[u8], source: Rank) -> Delivery {
        let header = match Header::peek(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!(%source, error = %e, "Dropping unreadable message");
                return Delivery::Malformed;
            }
        };

        let kind = match header.message_kind() {
            Ok(kind) => kind,
            Err(_) => {
                warn!(%source, kind = header.kind, "Dropping message of unknown kind");
                return Delivery::UnknownKind(header.kind);
            }
        };

        match self.handlers.get_mut(&kind) {
            Some(handler) => {
                trace!(%source, %kind, seq = header.sequence_number, "Dispatching");
                handler(bytes, source);
                Delivery::Handled(kind)
            }
            None => {
                warn!(%source, %kind, "No handler registered");
                Delivery::Unhandled(kind)
            }
        }
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("MessageDispatcher").field("kinds", &kinds).finish()
    }
}
