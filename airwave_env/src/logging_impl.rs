//! Logging-only transport used when no real transport is available.

use crate::error::EnvError;
use crate::network::NetworkTransport;
use crate::types::Rank;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;

/// A transport that delivers nothing and records what would have been sent.
///
/// Device ranks fall back to this when the real transport cannot be brought
/// up: every `send` succeeds, is logged at `info` and kept for inspection.
/// `recv` reports a closed transport immediately.
pub struct LoggingTransport {
    local_rank: Rank,

    outbox: Mutex<Vec<(Rank, Bytes)>>,
}

impl LoggingTransport {
    /// Creates a logging transport for `local_rank`.
    pub fn new(local_rank: Rank) -> Self {
        Self {
            local_rank,
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Messages "sent" so far, in send order.
    pub fn sent(&self) -> Vec<(Rank, Bytes)> {
        self.outbox
            .lock()
            .map(|o| o.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Number of messages "sent" so far.
    pub fn sent_count(&self) -> usize {
        self.outbox.lock().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl NetworkTransport for LoggingTransport {
    fn send(&self, target: Rank, bytes: Bytes) -> Result<(), EnvError> {
        tracing::info!(
            from = %self.local_rank,
            to = %target,
            len = bytes.len(),
            "transport unavailable, recording message instead of sending"
        );
        match self.outbox.lock() {
            Ok(mut outbox) => outbox.push((target, bytes)),
            Err(poisoned) => poisoned.into_inner().push((target, bytes)),
        }
        Ok(())
    }

    async fn recv(&self) -> Option<(Rank, Bytes)> {
        None
    }

    fn local_rank(&self) -> Rank {
        self.local_rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_transport_records() {
        let transport = LoggingTransport::new(Rank(2));
        transport.send(Rank(0), Bytes::from_static(b"abc")).unwrap();
        transport.send(Rank(0), Bytes::from_static(b"de")).unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Rank(0));
        assert_eq!(sent[1].1.as_ref(), b"de");
        assert_eq!(transport.local_rank(), Rank(2));
    }

    #[tokio::test]
    async fn test_logging_transport_recv_closed() {
        let transport = LoggingTransport::new(Rank(1));
        assert!(transport.recv().await.is_none());
    }
}
