use std::fmt;

use crate::node::config::NodeId;

/// Where a flushed frame goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Every listed node receives its own copy of the frame.
    Nodes(Vec<NodeId>),
    /// The coordinating node, whatever its id is on this transport.
    Coordinator,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Nodes(nodes) => write!(f, "nodes {:?}", nodes),
            Destination::Coordinator => f.write_str("the coordinator"),
        }
    }
}

/// The link layer between nodes. Implementations own connection setup and
/// byte movement; the node only hands over whole frames and polls for
/// received ones.
pub trait Transport {
    /// Transmits one full frame to every node in `to`. Returns false if the
    /// transport refused it; the caller treats that as fatal.
    fn send(&mut self, to: &Destination, frame: &[u8]) -> bool;

    /// Returns the next received frame, if one is already waiting. Never
    /// blocks.
    fn poll_frame(&mut self) -> Option<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, to: &Destination, frame: &[u8]) -> bool {
        (**self).send(to, frame)
    }

    fn poll_frame(&mut self) -> Option<Vec<u8>> {
        (**self).poll_frame()
    }
}
