//! How signed messages move between nodes.

use crate::engine::PbftEngine;
use crate::message::SignedMessage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Outbound side of the network as seen by one engine.
///
/// Delivery is best effort: messages may be delayed, duplicated or
/// reordered, and the protocol tolerates all three.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to every participant except its sender.
    async fn broadcast(&self, message: SignedMessage);
}

/// In-process network connecting engines through unbounded inboxes.
///
/// Every delivered message is handled on its own task, so handlers for
/// different sequences run concurrently.
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<BTreeMap<String, mpsc::UnboundedSender<SignedMessage>>>,
    partitioned: RwLock<BTreeSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an engine and start pumping its inbox. Must be called from
    /// inside a tokio runtime.
    pub fn connect(&self, engine: Arc<PbftEngine>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignedMessage>();
        self.inboxes.write().insert(engine.node_id().to_string(), tx);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let kind = message.kind();
                    let sender = message.sender.clone();
                    if let Err(e) = engine.handle_message(message).await {
                        debug!(
                            node = %engine.node_id(),
                            %sender,
                            %kind,
                            error = %e,
                            "Message dropped"
                        );
                    }
                });
            }
        })
    }

    /// Cut a node off: it neither sends nor receives until healed.
    pub fn partition(&self, node_id: &str) {
        self.partitioned.write().insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.partitioned.write().remove(node_id);
    }

    /// Drop every inbox, ending the pump tasks.
    pub fn shutdown(&self) {
        self.inboxes.write().clear();
    }

    pub fn node_count(&self) -> usize {
        self.inboxes.read().len()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn broadcast(&self, message: SignedMessage) {
        let partitioned = self.partitioned.read();
        if partitioned.contains(&message.sender) {
            return;
        }
        let inboxes = self.inboxes.read();
        for (node_id, inbox) in inboxes.iter() {
            if *node_id == message.sender || partitioned.contains(node_id) {
                continue;
            }
            // A closed inbox means the node was shut down.
            let _ = inbox.send(message.clone());
        }
    }
}
