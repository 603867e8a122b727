use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

use super::transport::{Destination, Transport};
use crate::node::config::NodeId;

type Peers = Arc<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>;

/// An in-process mesh: one unbounded channel per node. Useful for running a
/// whole fleet on one machine.
pub struct Mesh;

impl Mesh {
    /// Creates a connected transport for every id in `nodes`. The coordinator
    /// must be one of them.
    pub fn build(nodes: &[NodeId], coordinator: NodeId) -> HashMap<NodeId, MemoryTransport> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::with_capacity(nodes.len());
        for &id in nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(id, tx);
            receivers.push((id, rx));
        }
        let peers: Peers = Arc::new(senders);
        receivers
            .into_iter()
            .map(|(id, rx)| {
                (
                    id,
                    MemoryTransport {
                        id,
                        coordinator,
                        peers: peers.clone(),
                        rx,
                    },
                )
            })
            .collect()
    }
}

/// One node's end of a [`Mesh`].
pub struct MemoryTransport {
    id: NodeId,
    coordinator: NodeId,
    peers: Peers,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn deliver(&self, to: NodeId, frame: &[u8]) -> bool {
        match self.peers.get(&to) {
            Some(tx) => tx.send(frame.to_vec()).is_ok(),
            None => {
                warn!("node {} is not part of the mesh", to);
                false
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, to: &Destination, frame: &[u8]) -> bool {
        match to {
            Destination::Nodes(nodes) => nodes.iter().all(|&node| self.deliver(node, frame)),
            Destination::Coordinator => self.deliver(self.coordinator, frame),
        }
    }

    fn poll_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_every_listed_node() {
        let mut mesh = Mesh::build(&[0, 1, 2], 0);
        let mut one = mesh.remove(&1).unwrap();
        assert_eq!(one.id(), 1);
        assert!(one.send(&Destination::Nodes(vec![1, 2]), &[7]));
        assert!(one.send(&Destination::Coordinator, &[8]));

        assert_eq!(one.poll_frame(), Some(vec![7]));
        assert_eq!(one.poll_frame(), None);
        assert_eq!(mesh.get_mut(&2).unwrap().poll_frame(), Some(vec![7]));
        assert_eq!(mesh.get_mut(&0).unwrap().poll_frame(), Some(vec![8]));
    }

    #[test]
    fn unknown_nodes_are_rejected() {
        let mut mesh = Mesh::build(&[0, 1], 0);
        let one = mesh.get_mut(&1).unwrap();
        assert!(!one.send(&Destination::Nodes(vec![5]), &[1]));
    }
}
