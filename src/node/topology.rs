use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};

use super::{
    error::{Error, Result},
    storage::{self, Storage},
};

/// Index of the pooling layer in the reference network.
pub const TERMINAL_LAYER: usize = 51;
/// Layers in the reference network: 51 standard, the pooling layer and one
/// classifier layer.
pub const LAYER_COUNT: usize = 53;

/// How the controller treats a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    /// Output is fanned out to the next layer's consumers.
    Standard,
    /// Output goes to the coordinator as pooled data.
    Terminal,
    /// Output is produced in fixed-size segments and goes to the coordinator
    /// as the final result.
    Classifier,
}

/// One group of a layer's mapping: a set of destination nodes and how many
/// elements they are owed.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct MappingGroup {
    /// Bit `k` set means node `k` is a destination.
    pub destinations: u128,
    /// Elements sent to this group, padding included.
    pub count: u32,
    /// Strictly ascending positions within `count` filled with the zero
    /// point instead of output.
    pub padding: Vec<u32>,
}

impl MappingGroup {
    /// Elements of this group that consume real output bytes.
    pub fn real_count(&self) -> usize {
        self.count as usize - self.padding.len()
    }
}

/// Output quantization of a layer.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Build-time facts about one layer as seen from one node.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct LayerDescriptor {
    /// Bytes this node must receive before it can compute the layer.
    pub input_length: u32,
    /// Bytes this node produces for the layer.
    pub result_length: u32,
    /// How the previous layer's output is split across this layer's
    /// consumers.
    pub mapping: Vec<MappingGroup>,
    pub quant: QuantParams,
    /// Earlier layer whose output is added to this one's.
    pub residual_source: Option<u32>,
}

/// Per-node table of every layer, loaded once at startup.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Topology {
    pub terminal_layer: u32,
    pub layers: Vec<LayerDescriptor>,
}

impl Topology {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn terminal_layer(&self) -> usize {
        self.terminal_layer as usize
    }

    pub fn kind(&self, layer: usize) -> LayerKind {
        let terminal = self.terminal_layer();
        if layer < terminal {
            LayerKind::Standard
        } else if layer == terminal {
            LayerKind::Terminal
        } else {
            LayerKind::Classifier
        }
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerDescriptor> {
        self.layers
            .get(layer)
            .ok_or_else(|| Error::Topology(format!("no layer {}", layer)))
    }

    pub fn input_length(&self, layer: usize) -> Result<usize> {
        Ok(self.layer(layer)?.input_length as usize)
    }

    pub fn result_length(&self, layer: usize) -> Result<usize> {
        Ok(self.layer(layer)?.result_length as usize)
    }

    /// Checks the invariants the controller relies on.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::Topology("no layers".into()));
        }
        let terminal = self.terminal_layer();
        if terminal >= self.layers.len() {
            return Err(Error::Topology(format!(
                "terminal layer {} is past the last layer {}",
                terminal,
                self.layers.len() - 1
            )));
        }
        for (j, layer) in self.layers.iter().enumerate() {
            for (g, group) in layer.mapping.iter().enumerate() {
                if group.padding.len() > group.count as usize {
                    return Err(Error::Topology(format!(
                        "layer {} group {} has more padding than elements",
                        j, g
                    )));
                }
                let ascending = group.padding.windows(2).all(|w| w[0] < w[1]);
                let in_range = group.padding.iter().all(|&p| p < group.count);
                if !ascending || !in_range {
                    return Err(Error::Topology(format!(
                        "layer {} group {} padding must be strictly ascending and below {}",
                        j, g, group.count
                    )));
                }
            }
            if let Some(source) = layer.residual_source {
                if source as usize >= j {
                    return Err(Error::Topology(format!(
                        "layer {} takes a residual from layer {}, which does not precede it",
                        j, source
                    )));
                }
            }
        }
        for j in 0..terminal {
            let owed: usize = self.layers[j + 1]
                .mapping
                .iter()
                .map(MappingGroup::real_count)
                .sum();
            let produced = self.layers[j].result_length as usize;
            if owed != produced {
                return Err(Error::Topology(format!(
                    "layer {} produces {} bytes but the mapping of layer {} distributes {}",
                    j,
                    produced,
                    j + 1,
                    owed
                )));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<AlignedVec> {
        to_bytes::<_, 1024>(self).map_err(|_| Error::Topology("could not serialize".into()))
    }

    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        from_bytes::<Topology>(&aligned).map_err(|_| Error::CorruptRecord {
            name: name.to_string(),
            offset: 0,
        })
    }

    pub fn save<S: Storage>(&self, storage: &S, name: &str) -> Result<()> {
        storage::write_all(storage, name, &self.to_bytes()?)
    }

    pub fn load<S: Storage>(storage: &S, name: &str) -> Result<Self> {
        let topology = Self::from_bytes(&storage::read_all(storage, name)?, name)?;
        topology.validate()?;
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{storage::MemStorage, testing::chain_topology};

    #[test]
    fn kinds_follow_the_terminal_index() {
        let topology = Topology {
            terminal_layer: TERMINAL_LAYER as u32,
            layers: vec![],
        };
        assert_eq!(topology.kind(0), LayerKind::Standard);
        assert_eq!(topology.kind(50), LayerKind::Standard);
        assert_eq!(topology.kind(51), LayerKind::Terminal);
        assert_eq!(topology.kind(52), LayerKind::Classifier);
    }

    #[test]
    fn survives_storage() {
        let storage = MemStorage::new();
        let topology = chain_topology(4, 2, &[8, 6, 4, 2], &[6, 4, 2, 2], 1);
        topology.save(&storage, "topology.bin").unwrap();
        assert_eq!(Topology::load(&storage, "topology.bin").unwrap(), topology);
    }

    #[test]
    fn garbage_is_a_corrupt_record() {
        let storage = MemStorage::new();
        storage::write_all(&storage, "topology.bin", &[1, 2, 3]).unwrap();
        assert!(matches!(
            Topology::load(&storage, "topology.bin"),
            Err(Error::CorruptRecord { .. })
        ));
    }

    #[test]
    fn rejects_mappings_that_do_not_match_the_output() {
        let mut topology = chain_topology(3, 1, &[4, 4, 4], &[4, 4, 4], 1);
        topology.layers[1].mapping[0].count += 1;
        assert!(matches!(topology.validate(), Err(Error::Topology(_))));
    }

    #[test]
    fn rejects_unordered_padding() {
        let mut topology = chain_topology(3, 1, &[4, 4, 4], &[4, 4, 4], 1);
        let group = &mut topology.layers[1].mapping[0];
        group.count = 6;
        group.padding = vec![3, 1];
        assert!(matches!(topology.validate(), Err(Error::Topology(_))));
        topology.layers[1].mapping[0].padding = vec![1, 3];
        topology.validate().unwrap();
    }

    #[test]
    fn rejects_forward_residuals() {
        let mut topology = chain_topology(3, 1, &[4, 4, 4], &[4, 4, 4], 1);
        topology.layers[1].residual_source = Some(1);
        assert!(matches!(topology.validate(), Err(Error::Topology(_))));
    }
}
