//! An in-process [`Dispatcher`] delivering requests straight to
//! [`NodeContext`]s registered in a host table. This is the transport used by
//! tests and by single-process clusters; a networked deployment swaps in a
//! dispatcher that speaks to remote nodes instead.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::node::NodeContext;
use crate::operation::{Request, Response};

use super::{Dispatcher, Error, Result};

#[derive(Default)]
pub struct LocalDispatcher {
    nodes: RwLock<HashMap<String, Arc<NodeContext>>>,
}

impl LocalDispatcher {
    /// Makes a node reachable under its host id
    pub fn register(&self, node: Arc<NodeContext>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.host_id().to_string(), node);
        }
    }

    /// Removes a node from the host table, simulating its departure
    pub fn deregister(&self, host: &str) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.remove(host);
        }
    }

    fn lookup(&self, host: &str) -> Result<Arc<NodeContext>> {
        let nodes = self.nodes.read().map_err(|_| Error::Connection {
            host: host.to_string(),
            reason: "host table lock poisoned".to_string(),
        })?;
        nodes.get(host).cloned().ok_or_else(|| Error::UnknownHost {
            host: host.to_string(),
        })
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn send(&self, host: &str, request: Request) -> Result<Response> {
        let node = self.lookup(host)?;
        Ok(node.execute(request).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::dispatcher::{Dispatcher, Error};
    use crate::index::in_memory::InMemoryIndex;
    use crate::index::SpatialIndex;
    use crate::node::NodeContext;
    use crate::operation::{Request, Response};

    use super::LocalDispatcher;

    #[tokio::test]
    async fn send_reaches_the_registered_node() {
        let index = Arc::new(InMemoryIndex::default());
        index.create(2, 8).await.unwrap();
        let node = Arc::new(NodeContext::new("127.0.0.1:4001".to_string(), index));

        let dispatcher = LocalDispatcher::default();
        dispatcher.register(node);

        let response = dispatcher
            .send(
                "127.0.0.1:4001",
                Request::Put {
                    key: vec![1, 2],
                    value: Bytes::from("a"),
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Entry { entry: None }));
    }

    #[tokio::test]
    async fn unknown_host_fails() {
        let dispatcher = LocalDispatcher::default();
        let err = dispatcher
            .send("127.0.0.1:4001", Request::Get { key: vec![0, 0] })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownHost { .. }));
    }

    #[tokio::test]
    async fn deregistered_host_becomes_unreachable() {
        let index = Arc::new(InMemoryIndex::default());
        index.create(2, 8).await.unwrap();
        let node = Arc::new(NodeContext::new("127.0.0.1:4001".to_string(), index));

        let dispatcher = LocalDispatcher::default();
        dispatcher.register(node);
        dispatcher.deregister("127.0.0.1:4001");

        assert!(dispatcher
            .send("127.0.0.1:4001", Request::Get { key: vec![0, 0] })
            .await
            .is_err());
    }
}
