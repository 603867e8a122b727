//! Synthetic partitioned networks for simulations and tests.
//!
//! Every layer is dense and split across the workers in contiguous output
//! ranges. Each worker broadcasts its range to every worker, and the first
//! and last worker frame the next layer's input with zero-point padding.
//! Because the coordinator paces workers in order, every receiver ends up
//! with `[pad, worker 0, worker 1, ..., pad]`.

use std::ops::Range;

use rand::{rngs::StdRng, Rng, SeedableRng};
use typed_builder::TypedBuilder;

use super::{
    config::{NodeConfig, NodeId, LINEAR_SEGMENT},
    coordinator::InferencePass,
    error::{Error, Result},
    kernel::{DotProductKernel, Kernel, ResultSink},
    loader::{write_weights, WeightBlock, WeightEntry},
    mapping::encode_destinations,
    storage::Storage,
    topology::{LayerDescriptor, MappingGroup, QuantParams, Topology},
};

/// Zero point of the raw network input.
const INPUT_ZERO_POINT: u8 = 128;

/// Shape of a synthetic network and how it is split.
#[derive(TypedBuilder, Clone, Debug)]
pub struct ModelPlan {
    /// Worker ids in the order the coordinator paces them.
    pub workers: Vec<NodeId>,
    /// Output width of every layer up to and including the pooling layer.
    pub widths: Vec<usize>,
    #[builder(default = 16)]
    pub input_width: usize,
    #[builder(default = 10)]
    pub classifier_width: usize,
    /// Zero-point elements on each side of every hidden layer's input.
    #[builder(default = 1)]
    pub padding: usize,
    #[builder(default = LINEAR_SEGMENT)]
    pub classifier_segment: usize,
    /// Every layer at a multiple of this takes a residual from two layers
    /// back. Zero disables residuals.
    #[builder(default = 4)]
    pub residual_every: usize,
    #[builder(default)]
    pub seed: u64,
}

/// Everything one worker needs on its storage.
#[derive(Clone, Debug)]
pub struct WorkerModel {
    pub id: NodeId,
    pub topology: Topology,
    pub blocks: Vec<WeightBlock>,
}

impl WorkerModel {
    /// Writes the topology and weight files named by `config`.
    pub fn install<S: Storage>(&self, storage: &S, config: &NodeConfig) -> Result<()> {
        self.topology.save(storage, &config.topology_file)?;
        write_weights(storage, &config.weights_file, &self.blocks)
    }
}

#[derive(Clone, Debug)]
pub struct Model {
    pub plan: ModelPlan,
    pub workers: Vec<WorkerModel>,
}

impl ModelPlan {
    pub fn terminal_layer(&self) -> usize {
        self.widths.len().saturating_sub(1)
    }

    /// Layers including the classifier.
    pub fn layer_count(&self) -> usize {
        self.widths.len() + 1
    }

    /// The outputs of a `width` wide layer that worker `index` computes.
    pub fn share(&self, width: usize, index: usize) -> Range<usize> {
        let n = self.workers.len().max(1);
        let base = width / n;
        let extra = width % n;
        let start = index * base + index.min(extra);
        start..start + base + usize::from(index < extra)
    }

    /// Bytes of classifier output expected from each worker, in order.
    pub fn classifier_lengths(&self) -> Vec<usize> {
        (0..self.workers.len())
            .map(|i| self.share(self.classifier_width, i).len())
            .collect()
    }

    pub fn quant(&self, layer: usize) -> QuantParams {
        QuantParams {
            scale: 1.0 / 32.0,
            zero_point: 120 + (layer % 8) as u8,
        }
    }

    fn input_zero_point(&self, layer: usize) -> u8 {
        match layer {
            0 => INPUT_ZERO_POINT,
            j => self.quant(j - 1).zero_point,
        }
    }

    fn input_length(&self, layer: usize) -> usize {
        let terminal = self.terminal_layer();
        match layer {
            0 => self.input_width,
            j if j <= terminal => self.widths[j - 1] + 2 * self.padding,
            _ => self.widths[terminal],
        }
    }

    fn residual_source(&self, layer: usize) -> Option<u32> {
        let eligible = self.residual_every > 0
            && layer >= 2
            && layer <= self.terminal_layer()
            && layer % self.residual_every == 0
            && self.widths[layer] == self.widths[layer - 2];
        eligible.then(|| (layer - 2) as u32)
    }

    fn validate(&self) -> Result<()> {
        let n = self.workers.len();
        if n == 0 || self.widths.is_empty() {
            return Err(Error::Config("a model needs workers and layers".into()));
        }
        if self.widths.iter().any(|&w| w < n) || self.classifier_width < n {
            return Err(Error::Config(format!(
                "every layer needs at least one output per worker ({})",
                n
            )));
        }
        if self.input_width == 0 || self.classifier_segment == 0 {
            return Err(Error::Config(
                "input width and classifier segment must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generates every worker's topology and weights.
    pub fn build(&self) -> Result<Model> {
        self.validate()?;
        let everyone = encode_destinations(&self.workers)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let workers = (0..self.workers.len())
            .map(|i| -> Result<WorkerModel> {
                let topology = self.worker_topology(i, everyone);
                topology.validate()?;
                let blocks = self.worker_weights(i, &mut rng);
                Ok(WorkerModel {
                    id: self.workers[i],
                    topology,
                    blocks,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Model {
            plan: self.clone(),
            workers,
        })
    }

    fn worker_topology(&self, i: usize, everyone: u128) -> Topology {
        let terminal = self.terminal_layer();
        let last = self.workers.len() - 1;
        let mut layers: Vec<LayerDescriptor> = (0..=terminal)
            .map(|j| {
                let mapping = match j.checked_sub(1) {
                    Some(producer) => {
                        let produced = self.share(self.widths[producer], i).len();
                        let leading = if i == 0 { self.padding } else { 0 };
                        let trailing = if i == last { self.padding } else { 0 };
                        let count = leading + produced + trailing;
                        let padding = (0..leading)
                            .chain(leading + produced..count)
                            .map(|p| p as u32)
                            .collect();
                        vec![MappingGroup {
                            destinations: everyone,
                            count: count as u32,
                            padding,
                        }]
                    }
                    None => vec![],
                };
                LayerDescriptor {
                    input_length: self.input_length(j) as u32,
                    result_length: self.share(self.widths[j], i).len() as u32,
                    mapping,
                    quant: self.quant(j),
                    residual_source: self.residual_source(j),
                }
            })
            .collect();
        layers.push(LayerDescriptor {
            input_length: self.input_length(terminal + 1) as u32,
            result_length: self.share(self.classifier_width, i).len() as u32,
            mapping: vec![],
            quant: self.quant(terminal + 1),
            residual_source: None,
        });
        Topology {
            terminal_layer: terminal as u32,
            layers,
        }
    }

    fn entry(&self, rng: &mut StdRng, layer: usize, output_index: usize) -> WeightEntry {
        let len = self.input_length(layer);
        WeightEntry {
            output_index: output_index as u32,
            input_offset: 0,
            weights: (0..len).map(|_| rng.gen_range(-8..=8)).collect(),
            bias: rng.gen_range(-64..64),
            multiplier: 1.0 / (4.0 * (len as f32).sqrt()),
            zero_points: [
                self.input_zero_point(layer) as i32,
                0,
                self.quant(layer).zero_point as i32,
            ],
        }
    }

    fn worker_weights(&self, i: usize, rng: &mut StdRng) -> Vec<WeightBlock> {
        let terminal = self.terminal_layer();
        let mut blocks: Vec<WeightBlock> = (0..=terminal)
            .map(|j| WeightBlock {
                layer: j as u32,
                last: true,
                entries: (0..self.share(self.widths[j], i).len())
                    .map(|o| self.entry(rng, j, o))
                    .collect(),
            })
            .collect();

        let classifier = terminal + 1;
        let outputs = self.share(self.classifier_width, i).len();
        let segments = outputs.div_ceil(self.classifier_segment);
        for s in 0..segments {
            let start = s * self.classifier_segment;
            let end = (start + self.classifier_segment).min(outputs);
            blocks.push(WeightBlock {
                layer: classifier as u32,
                last: s + 1 == segments,
                entries: (start..end).map(|o| self.entry(rng, classifier, o)).collect(),
            });
        }
        blocks
    }

    /// A reproducible network input.
    pub fn random_input(&self) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
        (0..self.input_width).map(|_| rng.gen()).collect()
    }
}

impl Model {
    /// Layer 0 input for each worker: all of them see the whole input.
    pub fn inputs(&self, input: &[u8]) -> Vec<Vec<u8>> {
        vec![input.to_vec(); self.workers.len()]
    }

    /// Evaluates the network in one place, without a mesh, spill or framing.
    pub fn evaluate(&self, input: &[u8]) -> Result<InferencePass> {
        let plan = &self.plan;
        let terminal = plan.terminal_layer();
        let mut kernels: Vec<DotProductKernel> = self
            .workers
            .iter()
            .map(|w| DotProductKernel::new(&w.topology))
            .collect();

        let mut activation = input.to_vec();
        let mut pooled = Vec::new();
        for j in 0..=terminal {
            let mut output = Vec::with_capacity(plan.widths[j]);
            for (worker, kernel) in self.workers.iter().zip(&mut kernels) {
                let mut slice = vec![0u8; worker.topology.result_length(j)?];
                let mut sink = ResultSink::new(&mut slice, None);
                kernel.compute(j, &worker.blocks[j].entries, &activation, &mut sink)?;
                kernel.apply_residual_and_quantize(j, &mut sink)?;
                output.extend_from_slice(&slice);
            }
            if j < terminal {
                let zero_point = plan.quant(j).zero_point;
                activation = std::iter::repeat(zero_point)
                    .take(plan.padding)
                    .chain(output)
                    .chain(std::iter::repeat(zero_point).take(plan.padding))
                    .collect();
            } else {
                pooled = output;
            }
        }

        let classifier = terminal + 1;
        let mut results = Vec::with_capacity(self.workers.len());
        for (worker, kernel) in self.workers.iter().zip(&mut kernels) {
            let mut result = vec![0u8; worker.topology.result_length(classifier)?];
            let mut sink = ResultSink::new(&mut result, None);
            for block in &worker.blocks[classifier..] {
                kernel.compute(classifier, &block.entries, &pooled, &mut sink)?;
            }
            kernel.apply_residual_and_quantize(classifier, &mut sink)?;
            results.push((worker.id, result));
        }
        Ok(InferencePass { pooled, results })
    }
}
