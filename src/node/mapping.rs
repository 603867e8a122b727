use super::{
    config::NodeId,
    error::{Error, Result},
    topology::{MappingGroup, Topology},
};

/// Width of a destination mask in bits. Every node in the mesh must agree on
/// it; ids at or above it cannot be addressed.
pub const MASK_WIDTH: u32 = u128::BITS;

/// Lists the nodes whose bits are set in `mask`, lowest id first.
pub fn decode_destinations(mask: u128) -> Vec<NodeId> {
    let mut nodes = Vec::with_capacity(mask.count_ones() as usize);
    let mut rest = mask;
    while rest != 0 {
        nodes.push(rest.trailing_zeros() as NodeId);
        rest &= rest - 1;
    }
    nodes
}

/// Inverse of [`decode_destinations`].
pub fn encode_destinations(nodes: &[NodeId]) -> Result<u128> {
    nodes.iter().try_fold(0u128, |mask, &node| {
        if node as u32 >= MASK_WIDTH {
            return Err(Error::NodeOutOfRange(node));
        }
        Ok(mask | 1u128 << node)
    })
}

/// One destination group with its nodes decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationGroup {
    pub destinations: Vec<NodeId>,
    pub count: usize,
    pub padding: Vec<usize>,
}

impl DestinationGroup {
    /// The order in which this group's elements are sent.
    pub fn elements(&self, zero_point: u8) -> GroupElements<'_> {
        GroupElements {
            padding: &self.padding,
            zero_point,
            next: 0,
            count: self.count,
            pad_cursor: 0,
        }
    }

    pub fn real_count(&self) -> usize {
        self.count - self.padding.len()
    }
}

impl From<&MappingGroup> for DestinationGroup {
    fn from(group: &MappingGroup) -> Self {
        Self {
            destinations: decode_destinations(group.destinations),
            count: group.count as usize,
            padding: group.padding.iter().map(|&p| p as usize).collect(),
        }
    }
}

/// How one layer's output is distributed to the next layer's consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub groups: Vec<DestinationGroup>,
    pub zero_point: u8,
}

impl Mapping {
    /// Output bytes the merge pass will consume.
    pub fn real_len(&self) -> usize {
        self.groups.iter().map(DestinationGroup::real_count).sum()
    }

    /// Elements the merge pass will send, padding included.
    pub fn total_len(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }
}

/// Builds the mapping stored with `layer`: the split of layer `layer - 1`'s
/// output. Padding carries the producer's output zero point.
pub fn resolve(topology: &Topology, layer: usize) -> Result<Mapping> {
    let producer = layer
        .checked_sub(1)
        .ok_or_else(|| Error::Topology("layer 0 has no producer to map".into()))?;
    let descriptor = topology.layer(layer)?;
    Ok(Mapping {
        groups: descriptor.mapping.iter().map(DestinationGroup::from).collect(),
        zero_point: topology.layer(producer)?.quant.zero_point,
    })
}

/// A slot in a group's element sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Element {
    /// Send the zero point; no output byte is consumed.
    Padding(u8),
    /// Send the next output byte.
    Output,
}

/// Walks a group's elements, interleaving padding at its positions.
pub struct GroupElements<'a> {
    padding: &'a [usize],
    zero_point: u8,
    next: usize,
    count: usize,
    pad_cursor: usize,
}

impl Iterator for GroupElements<'_> {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        if self.next == self.count {
            return None;
        }
        let k = self.next;
        self.next += 1;
        if self.padding.get(self.pad_cursor) == Some(&k) {
            self.pad_cursor += 1;
            Some(Element::Padding(self.zero_point))
        } else {
            Some(Element::Output)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for GroupElements<'_> {}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::node::{testing::chain_topology, topology::QuantParams};

    #[test]
    fn decodes_set_bits_in_ascending_order() {
        assert_eq!(decode_destinations(0), Vec::<NodeId>::new());
        assert_eq!(decode_destinations(0b1011), vec![0, 1, 3]);
        assert_eq!(decode_destinations(1u128 << 127), vec![127]);
        assert_eq!(decode_destinations(u128::MAX).len(), 128);
    }

    #[test]
    fn random_subsets_survive_the_mask() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let nodes: Vec<NodeId> = (0..128u8).filter(|_| rng.gen_bool(0.3)).collect();
            assert_eq!(decode_destinations(encode_destinations(&nodes).unwrap()), nodes);
        }
    }

    #[test]
    fn encodes_the_full_id_range() {
        assert_eq!(encode_destinations(&[0, 1, 3]).unwrap(), 0b1011);
        assert_eq!(encode_destinations(&[127]).unwrap(), 1u128 << 127);
        let all: Vec<NodeId> = (0..128).collect();
        assert_eq!(encode_destinations(&all).unwrap(), u128::MAX);
        assert_eq!(decode_destinations(u128::MAX), all);
    }

    #[test]
    fn ids_past_the_mask_are_rejected() {
        assert!(matches!(
            encode_destinations(&[3, 128]),
            Err(Error::NodeOutOfRange(128))
        ));
    }

    #[test]
    fn padding_is_interleaved_without_consuming_output() {
        let group = DestinationGroup {
            destinations: vec![1],
            count: 5,
            padding: vec![1, 3],
        };
        let elements: Vec<_> = group.elements(0x80).collect();
        assert_eq!(
            elements,
            vec![
                Element::Output,
                Element::Padding(0x80),
                Element::Output,
                Element::Padding(0x80),
                Element::Output,
            ]
        );
        assert_eq!(group.real_count(), 3);
        assert_eq!(group.elements(0).len(), 5);
    }

    #[test]
    fn padding_may_fill_a_whole_group() {
        let group = DestinationGroup {
            destinations: vec![2],
            count: 3,
            padding: vec![0, 1, 2],
        };
        assert!(group.elements(9).all(|e| e == Element::Padding(9)));
        assert_eq!(group.real_count(), 0);
    }

    #[test]
    fn resolves_the_next_layers_table() {
        let mut topology = chain_topology(3, 2, &[4, 6, 4], &[4, 4, 2], 3);
        topology.layers[0].quant = QuantParams {
            scale: 0.5,
            zero_point: 12,
        };
        topology.layers[1].mapping = vec![
            MappingGroup {
                destinations: 0b0110,
                count: 4,
                padding: vec![0, 3],
            },
            MappingGroup {
                destinations: 0b1000,
                count: 2,
                padding: vec![],
            },
        ];
        topology.validate().unwrap();

        let mapping = resolve(&topology, 1).unwrap();
        assert_eq!(mapping.zero_point, 12);
        assert_eq!(mapping.groups[0].destinations, vec![1, 2]);
        assert_eq!(mapping.groups[0].padding, vec![0, 3]);
        assert_eq!(mapping.groups[1].destinations, vec![3]);
        assert_eq!(mapping.real_len(), 4);
        assert_eq!(mapping.total_len(), 6);
        assert!(resolve(&topology, 0).is_err());
    }
}
