use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use super::request::NodeAddress;

/// Failures reported by a messaging service for a single exchange.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MessagingError {
    /// Nothing accepted a connection at the address.
    #[error("connection refused by {address}")]
    ConnectionRefused { address: NodeAddress },
    /// The node is up, but nothing handles this topic on it (yet).
    #[error("no remote handler registered for topic {topic}")]
    NoRemoteHandler { topic: String },
    /// The remote handler ran and failed.
    #[error("remote handler failed: {0}")]
    RemoteHandlerFailure(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Topic-addressed, node-addressed byte exchange.
///
/// Implementations may complete the returned future on any task or thread.
pub trait MessagingService: Send + Sync + 'static {
    /// Sends `payload` to the handler of `topic` on the node at `address` and
    /// resolves with its response, giving up after `timeout`.
    fn send_and_receive(
        &self,
        address: &NodeAddress,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Bytes, MessagingError>>;
}
