// Every node in the mesh runs the same single control flow: the layer
// controller. It owns the weight cursor, the on-chip result buffer, the spill
// region and the input buffer, and calls everything else synchronously. There
// is no task scheduler and nothing is shared between control flows, so there
// are no locks on the hot path.

// A layer's output is rarely consumed by the node that produced it. The mapping
// table tells the controller which nodes own which slice of the next layer's
// input, and the framer packs those bytes into fixed-size frames. Receivers
// never see sequence numbers; they rely on the fan-out visiting groups and
// elements in one fixed order and on the coordinator letting one sender talk
// at a time.

// While a node is sending it is usually also being sent to. Every element
// pushed into the framer is followed by a non-blocking drain of the inbox, so
// the next layer's input keeps flowing and upstream senders never stall on a
// node that is busy transmitting.

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
mod hex;
pub mod kernel;
pub mod loader;
pub mod mapping;
pub mod net;
pub mod observe;
pub mod provision;
pub mod spill;
pub mod storage;
pub mod topology;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;
