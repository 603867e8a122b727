use typed_builder::TypedBuilder;

use super::{
    error::{Error, Result},
    mapping::MASK_WIDTH,
    net::wire::RESERVED_BYTES,
};

/// Nodes are addressed by a single byte. Only ids below the destination mask
/// width can receive fan-out traffic.
pub type NodeId = u8;

/// Total size of every frame on the wire, header included.
pub const MESSAGE_SIZE: usize = 1024;
/// Capacity of the on-chip result buffer. Anything a layer produces past this
/// goes to the spill file.
pub const STACK_SIZE: usize = 64 * 1024;
/// Output bytes produced per kernel call in the classifier tail.
pub const LINEAR_SEGMENT: usize = 64;

pub const WEIGHTS_FILE: &str = "weights.bin";
pub const TOPOLOGY_FILE: &str = "topology.bin";
pub const SPILL_FILE: &str = "overflow.bin";

/// Per-node settings. Everything but the two ids has a default matching the
/// reference deployment.
#[derive(TypedBuilder, Clone, Debug)]
pub struct NodeConfig {
    /// This node's id, written into byte 0 of every frame it sends.
    pub node_id: NodeId,
    /// The node that gathers pooled and final results and hands out
    /// permission to send.
    pub coordinator_id: NodeId,
    #[builder(default = MESSAGE_SIZE)]
    pub message_size: usize,
    #[builder(default = STACK_SIZE)]
    pub stack_size: usize,
    #[builder(default = LINEAR_SEGMENT)]
    pub classifier_segment: usize,
    #[builder(default = WEIGHTS_FILE.into(), setter(into))]
    pub weights_file: String,
    #[builder(default = TOPOLOGY_FILE.into(), setter(into))]
    pub topology_file: String,
    #[builder(default = SPILL_FILE.into(), setter(into))]
    pub spill_file: String,
}

impl NodeConfig {
    /// Payload bytes carried by one full frame.
    pub fn payload_capacity(&self) -> usize {
        self.message_size.saturating_sub(RESERVED_BYTES)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_size <= RESERVED_BYTES {
            return Err(Error::Config(format!(
                "message_size {} leaves no room for a payload after the {} byte header",
                self.message_size, RESERVED_BYTES
            )));
        }
        if self.payload_capacity() > u16::MAX as usize {
            return Err(Error::Config(format!(
                "payload capacity {} does not fit the 16-bit length prefix",
                self.payload_capacity()
            )));
        }
        if self.stack_size == 0 {
            return Err(Error::Config("stack_size must be > 0".into()));
        }
        if self.classifier_segment == 0 {
            return Err(Error::Config("classifier_segment must be > 0".into()));
        }
        if self.node_id as u32 >= MASK_WIDTH {
            return Err(Error::NodeOutOfRange(self.node_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::builder().node_id(3).coordinator_id(0).build();
        assert_eq!(config.message_size, MESSAGE_SIZE);
        assert_eq!(config.spill_file, SPILL_FILE);
        assert_eq!(config.payload_capacity(), MESSAGE_SIZE - RESERVED_BYTES);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_frames_without_payload_room() {
        let config = NodeConfig::builder()
            .node_id(1)
            .coordinator_id(0)
            .message_size(RESERVED_BYTES)
            .build();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_ids_outside_the_mask() {
        let config = NodeConfig::builder().node_id(200).coordinator_id(0).build();
        assert!(matches!(config.validate(), Err(Error::NodeOutOfRange(200))));
    }
}
