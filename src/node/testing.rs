//! Fixtures shared by the unit tests.

use std::collections::VecDeque;

use super::{
    config::NodeId,
    loader::{WeightBlock, WeightEntry},
    net::transport::{Destination, Transport},
    topology::{LayerDescriptor, MappingGroup, QuantParams, Topology},
};

/// A transport that replays queued inbound frames and records every send.
#[derive(Default)]
pub struct ScriptedTransport {
    pub inbound: VecDeque<Vec<u8>>,
    pub sent: Vec<(Destination, Vec<u8>)>,
    pub reject_sends: bool,
    /// Hand out at most this many frames, then report nothing once, so
    /// callers see frames trickle in across several polls.
    pub release_per_poll: Option<usize>,
    /// Frames that only become receivable once `n` frames have been sent.
    pub after_sends: VecDeque<(usize, Vec<u8>)>,
    released: usize,
}

impl ScriptedTransport {
    pub fn with_inbound(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            inbound: frames.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, to: &Destination, frame: &[u8]) -> bool {
        if self.reject_sends {
            return false;
        }
        self.sent.push((to.clone(), frame.to_vec()));
        true
    }

    fn poll_frame(&mut self) -> Option<Vec<u8>> {
        let sent = self.sent.len();
        while self.after_sends.front().is_some_and(|(n, _)| *n <= sent) {
            if let Some((_, frame)) = self.after_sends.pop_front() {
                self.inbound.push_back(frame);
            }
        }
        if let Some(limit) = self.release_per_poll {
            if self.released == limit {
                self.released = 0;
                return None;
            }
            self.released += 1;
        }
        self.inbound.pop_front()
    }
}

/// A straight chain of layers: every standard layer's whole output goes to
/// `dest` as one group without padding.
pub fn chain_topology(
    layers: usize,
    terminal: usize,
    inputs: &[u32],
    results: &[u32],
    dest: NodeId,
) -> Topology {
    let layers = (0..layers)
        .map(|j| LayerDescriptor {
            input_length: inputs[j],
            result_length: results[j],
            mapping: match j.checked_sub(1) {
                Some(producer) if producer < terminal => vec![MappingGroup {
                    destinations: 1u128 << dest,
                    count: results[producer],
                    padding: vec![],
                }],
                _ => vec![],
            },
            quant: QuantParams::default(),
            residual_source: None,
        })
        .collect();
    Topology {
        terminal_layer: terminal as u32,
        layers,
    }
}

/// Output `i` copies input byte `i`, given identity quantization.
pub fn identity_block(layer: u32, n: u32) -> WeightBlock {
    WeightBlock {
        layer,
        last: true,
        entries: (0..n)
            .map(|i| WeightEntry {
                output_index: i,
                input_offset: i,
                weights: vec![1],
                bias: 0,
                multiplier: 1.0,
                zero_points: [0, 0, 0],
            })
            .collect(),
    }
}
