//! Layer-by-layer execution of a quantized network partitioned across a mesh
//! of memory-constrained nodes.

pub mod node;

pub use node::{
    config::NodeConfig,
    controller::{LayerState, Node},
    error::{Error, Result, Stage},
};
