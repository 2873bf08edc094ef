use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::trace;

use super::{
    messaging::{MessagingError, MessagingService},
    request::NodeAddress,
};

type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, String>> + Send + Sync>;

/// Messaging service connecting nodes that live in the same process.
///
/// Nodes and their topic handlers come and go at runtime, which makes it easy
/// to reproduce a cluster that is still starting up or failing over. Can be
/// cloned to obtain another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalMessagingService {
    nodes: Arc<RwLock<HashMap<NodeAddress, HashMap<String, Handler>>>>,
}

impl LocalMessagingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings up a node without any handlers. Connections to it succeed, but
    /// every topic reports a missing handler.
    pub async fn start_node(&self, address: impl Into<NodeAddress>) {
        let address = address.into();
        trace!(%address, "starting node");
        self.nodes.write().await.entry(address).or_default();
    }

    /// Takes a node down along with all its handlers.
    pub async fn stop_node(&self, address: &NodeAddress) {
        trace!(%address, "stopping node");
        self.nodes.write().await.remove(address);
    }

    /// Handles requests for `topic` on the node at `address`, starting the
    /// node if needed. Replaces any previous handler for the topic.
    pub async fn register_handler<F, Fut>(
        &self,
        address: impl Into<NodeAddress>,
        topic: impl Into<String>,
        handler: F,
    ) where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.nodes
            .write()
            .await
            .entry(address.into())
            .or_default()
            .insert(topic.into(), handler);
    }

    pub async fn unregister_handler(&self, address: &NodeAddress, topic: &str) {
        if let Some(handlers) = self.nodes.write().await.get_mut(address) {
            handlers.remove(topic);
        }
    }
}

impl MessagingService for LocalMessagingService {
    fn send_and_receive(
        &self,
        address: &NodeAddress,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Bytes, MessagingError>> {
        let nodes = self.nodes.clone();
        let address = address.clone();
        let topic = topic.to_owned();
        async move {
            let handler = {
                let nodes = nodes.read().await;
                let handlers = nodes
                    .get(&address)
                    .ok_or(MessagingError::ConnectionRefused { address })?;
                handlers
                    .get(&topic)
                    .cloned()
                    .ok_or(MessagingError::NoRemoteHandler { topic })?
            };
            match tokio::time::timeout(timeout, handler(payload)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(failure)) => Err(MessagingError::RemoteHandlerFailure(failure)),
                Err(_) => Err(MessagingError::Timeout(timeout)),
            }
        }
        .boxed()
    }
}
