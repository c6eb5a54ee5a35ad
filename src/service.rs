//! Node business logic above the repositories.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use url::Url;

use crate::error::{Error, Result};
use crate::health::Notifier;
use crate::store::node::Nodes;
use crate::store::sqlite::{Client, TxAccess};
use crate::types::{Node, NodeDraft};

#[derive(Clone)]
pub struct NodeService {
    client: Arc<Client>,
    nodes: Arc<Nodes>,
    notifier: Notifier,

    /// Time-to-live stamped on newly created nodes.
    ttl: Duration,
}

impl NodeService {
    pub fn new(client: Arc<Client>, nodes: Arc<Nodes>, notifier: Notifier, ttl: Duration) -> Self {
        Self {
            client,
            nodes,
            notifier,
            ttl,
        }
    }

    /// List the active nodes.
    pub async fn index(&self) -> Result<Vec<Node>> {
        self.nodes.select().await
    }

    pub async fn show(&self, id: i64) -> Result<Node> {
        self.nodes.select_one(id).await
    }

    /// Register a node. The supervisor is notified only after the insert
    /// committed, so it never observes a node the repository does not.
    pub async fn create(&self, draft: NodeDraft) -> Result<Node> {
        if let Err(err) = Url::parse(&draft.address) {
            return Err(Error::validation("invalid node", "address", err.to_string()));
        }

        let node = Node {
            id: 0,
            address: draft.address,
            metadata: draft.metadata.unwrap_or_default(),
            ttl: self.ttl,
            active: true,
            created_at: Utc::now(),
        };

        let nodes = Arc::clone(&self.nodes);
        let node = self
            .client
            .in_transaction(TxAccess::ReadWrite, move |tx| {
                Box::pin(async move { nodes.insert(tx, node).await })
            })
            .await?;

        self.notifier.add(node.clone());
        Ok(node)
    }
}
