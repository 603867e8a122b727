use hashbrown::{HashMap, HashSet};
use libm::roundf;
use tracing::trace;

use super::{
    error::{Error, Result},
    loader::WeightEntry,
    spill::OverflowRegion,
    topology::{QuantParams, Topology},
};

/// Where a kernel writes a layer's output. Indices below the on-chip
/// capacity land in the on-chip buffer; the rest go to the overflow region
/// staged by the spill manager.
pub struct ResultSink<'a> {
    on_chip: &'a mut [u8],
    overflow: Option<&'a mut OverflowRegion>,
}

impl<'a> ResultSink<'a> {
    pub fn new(on_chip: &'a mut [u8], overflow: Option<&'a mut OverflowRegion>) -> Self {
        Self { on_chip, overflow }
    }

    /// Total bytes the layer produces.
    pub fn len(&self) -> usize {
        self.on_chip.len() + self.overflow.as_ref().map_or(0, |o| o.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&mut self, index: usize, byte: u8) -> Result<()> {
        if let Some(slot) = self.on_chip.get_mut(index) {
            *slot = byte;
            return Ok(());
        }
        let len = self.len();
        match self.overflow.as_deref_mut() {
            Some(overflow) => overflow.write(index - self.on_chip.len(), &[byte]),
            None => Err(Error::Kernel(format!(
                "output index {} is past the {} byte result",
                index, len
            ))),
        }
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        match self.on_chip.get(index) {
            Some(&byte) => Some(byte),
            None => self
                .overflow
                .as_deref()
                .and_then(|o| o.as_slice().get(index - self.on_chip.len()).copied()),
        }
    }

    /// Both parts of the output, on-chip first.
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let overflow: &mut [u8] = match self.overflow.as_deref_mut() {
            Some(overflow) => overflow.as_mut_slice(),
            None => &mut [],
        };
        (&mut *self.on_chip, overflow)
    }
}

/// The arithmetic a node runs on each layer.
pub trait Kernel {
    /// Computes the outputs `entries` describe from `input` into `sink`.
    fn compute(
        &mut self,
        layer: usize,
        entries: &[WeightEntry],
        input: &[u8],
        sink: &mut ResultSink<'_>,
    ) -> Result<()>;

    /// Adds any residual branch to the finished output of `layer` and
    /// requantizes it in place.
    fn apply_residual_and_quantize(&mut self, layer: usize, output: &mut ResultSink<'_>)
        -> Result<()>;
}

/// Integer dot products with float requantization, the way the quantized
/// reference network is evaluated.
pub struct DotProductKernel {
    quant: Vec<QuantParams>,
    residual_of: HashMap<usize, usize>,
    sources: HashSet<usize>,
    saved: HashMap<usize, Vec<u8>>,
}

impl DotProductKernel {
    pub fn new(topology: &Topology) -> Self {
        let residual_of: HashMap<usize, usize> = topology
            .layers
            .iter()
            .enumerate()
            .filter_map(|(j, l)| l.residual_source.map(|s| (j, s as usize)))
            .collect();
        Self {
            quant: topology.layers.iter().map(|l| l.quant).collect(),
            sources: residual_of.values().copied().collect(),
            residual_of,
            saved: HashMap::new(),
        }
    }

    /// Layer outputs currently held for a later residual add.
    pub fn saved_layers(&self) -> usize {
        self.saved.len()
    }

    fn quant(&self, layer: usize) -> Result<QuantParams> {
        self.quant
            .get(layer)
            .copied()
            .ok_or_else(|| Error::Kernel(format!("no quantization for layer {}", layer)))
    }

    fn still_needed(&self, source: usize, after: usize) -> bool {
        self.residual_of
            .iter()
            .any(|(&consumer, &s)| s == source && consumer > after)
    }
}

fn saturate(value: f32) -> u8 {
    roundf(value).clamp(0.0, 255.0) as u8
}

fn dot(entry: &WeightEntry, input: &[u8]) -> Result<i32> {
    let start = entry.input_offset as usize;
    let window = input
        .get(start..start + entry.weights.len())
        .ok_or_else(|| {
            Error::Kernel(format!(
                "entry for output {} reads {}..{} of a {} byte input",
                entry.output_index,
                start,
                start + entry.weights.len(),
                input.len()
            ))
        })?;
    let [zp_in, zp_w, _] = entry.zero_points;
    Ok(window
        .iter()
        .zip(&entry.weights)
        .map(|(&x, &w)| (x as i32 - zp_in) * (w as i32 - zp_w))
        .sum())
}

impl Kernel for DotProductKernel {
    fn compute(
        &mut self,
        layer: usize,
        entries: &[WeightEntry],
        input: &[u8],
        sink: &mut ResultSink<'_>,
    ) -> Result<()> {
        for entry in entries {
            let acc = dot(entry, input)? + entry.bias;
            let out = saturate(acc as f32 * entry.multiplier + entry.zero_points[2] as f32);
            sink.put(entry.output_index as usize, out)?;
        }
        trace!("layer {}: computed {} outputs", layer, entries.len());
        Ok(())
    }

    fn apply_residual_and_quantize(
        &mut self,
        layer: usize,
        output: &mut ResultSink<'_>,
    ) -> Result<()> {
        if let Some(&source) = self.residual_of.get(&layer) {
            let own = self.quant(layer)?;
            let theirs = self.quant(source)?;
            let saved = self.saved.get(&source).ok_or_else(|| {
                Error::Kernel(format!(
                    "layer {} needs the output of layer {}, which was not kept",
                    layer, source
                ))
            })?;
            if saved.len() != output.len() {
                return Err(Error::Kernel(format!(
                    "residual from layer {} has {} bytes, layer {} has {}",
                    source,
                    saved.len(),
                    layer,
                    output.len()
                )));
            }
            let (on_chip, overflow) = output.parts_mut();
            for (y, &x) in on_chip.iter_mut().chain(overflow.iter_mut()).zip(saved) {
                let sum = (x as f32 - theirs.zero_point as f32) * theirs.scale
                    + (*y as f32 - own.zero_point as f32) * own.scale;
                *y = saturate(sum / own.scale + own.zero_point as f32);
            }
            if !self.still_needed(source, layer) {
                self.saved.remove(&source);
            }
        }

        if self.sources.contains(&layer) {
            let (on_chip, overflow) = output.parts_mut();
            let mut copy = Vec::with_capacity(on_chip.len() + overflow.len());
            copy.extend_from_slice(on_chip);
            copy.extend_from_slice(overflow);
            self.saved.insert(layer, copy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{observe::MemoryGauge, spill::SpillManager, storage::MemStorage, testing};

    fn entry(output_index: u32, input_offset: u32, weights: Vec<i8>) -> WeightEntry {
        WeightEntry {
            output_index,
            input_offset,
            weights,
            bias: 0,
            multiplier: 1.0,
            zero_points: [0, 0, 0],
        }
    }

    #[test]
    fn sink_routes_past_the_on_chip_capacity() {
        let gauge = MemoryGauge::new();
        let mut spill: SpillManager<MemStorage> = SpillManager::new("overflow.bin", gauge);
        spill.begin_layer(6, 4).unwrap();
        let mut on_chip = [0u8; 4];
        let mut sink = ResultSink::new(&mut on_chip, spill.region_mut());
        assert_eq!(sink.len(), 6);
        for i in 0..6 {
            sink.put(i, i as u8 + 10).unwrap();
        }
        assert_eq!(sink.get(5), Some(15));
        assert!(sink.put(6, 0).is_err());
        drop(sink);
        assert_eq!(on_chip, [10, 11, 12, 13]);
    }

    #[test]
    fn sink_without_overflow_is_bounded() {
        let mut on_chip = [0u8; 2];
        let mut sink = ResultSink::new(&mut on_chip, None);
        assert!(matches!(sink.put(2, 1), Err(Error::Kernel(_))));
    }

    #[test]
    fn dot_products_are_zero_point_corrected() {
        let topology = testing::chain_topology(1, 0, &[4], &[2], 1);
        let mut kernel = DotProductKernel::new(&topology);
        let mut first = entry(0, 0, vec![1, 2]);
        first.zero_points = [10, 0, 5];
        first.bias = 3;
        let mut second = entry(1, 2, vec![-1, 1]);
        second.multiplier = 0.5;

        let input = [12, 13, 40, 100];
        let mut out = [0u8; 2];
        kernel
            .compute(0, &[first, second], &input, &mut ResultSink::new(&mut out, None))
            .unwrap();
        // (2*1 + 3*2 + 3) + 5 and (-40 + 100) * 0.5
        assert_eq!(out, [16, 30]);
    }

    #[test]
    fn outputs_saturate() {
        let topology = testing::chain_topology(1, 0, &[1], &[2], 1);
        let mut kernel = DotProductKernel::new(&topology);
        let input = [200];
        let mut out = [7u8; 2];
        kernel
            .compute(
                0,
                &[entry(0, 0, vec![2]), entry(1, 0, vec![-1])],
                &input,
                &mut ResultSink::new(&mut out, None),
            )
            .unwrap();
        assert_eq!(out, [255, 0]);
    }

    #[test]
    fn reads_past_the_input_fail() {
        let topology = testing::chain_topology(1, 0, &[2], &[1], 1);
        let mut kernel = DotProductKernel::new(&topology);
        let mut out = [0u8; 1];
        let err = kernel
            .compute(
                0,
                &[entry(0, 1, vec![1, 1])],
                &[1, 2],
                &mut ResultSink::new(&mut out, None),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
    }

    #[test]
    fn residuals_add_the_saved_output() {
        let mut topology = testing::chain_topology(3, 2, &[2, 2, 2], &[2, 2, 2], 1);
        topology.layers[2].residual_source = Some(0);
        let mut kernel = DotProductKernel::new(&topology);

        let mut first = [3u8, 250];
        kernel
            .apply_residual_and_quantize(0, &mut ResultSink::new(&mut first, None))
            .unwrap();
        assert_eq!(kernel.saved_layers(), 1);

        let mut middle = [1u8, 1];
        kernel
            .apply_residual_and_quantize(1, &mut ResultSink::new(&mut middle, None))
            .unwrap();
        assert_eq!(middle, [1, 1]);

        let mut last = [4u8, 10];
        kernel
            .apply_residual_and_quantize(2, &mut ResultSink::new(&mut last, None))
            .unwrap();
        assert_eq!(last, [7, 255]);
        assert_eq!(kernel.saved_layers(), 0);
    }

    #[test]
    fn residuals_cover_the_overflow_region() {
        let mut topology = testing::chain_topology(2, 1, &[3, 3], &[3, 3], 1);
        topology.layers[1].residual_source = Some(0);
        let mut kernel = DotProductKernel::new(&topology);
        let mut first = [1u8, 2, 3];
        kernel
            .apply_residual_and_quantize(0, &mut ResultSink::new(&mut first, None))
            .unwrap();

        let mut spill: SpillManager<MemStorage> =
            SpillManager::new("overflow.bin", MemoryGauge::new());
        spill.begin_layer(3, 2).unwrap();
        let mut on_chip = [10u8, 20];
        let mut sink = ResultSink::new(&mut on_chip, spill.region_mut());
        sink.put(2, 30).unwrap();
        kernel.apply_residual_and_quantize(1, &mut sink).unwrap();
        assert_eq!(sink.get(2), Some(33));
        drop(sink);
        assert_eq!(on_chip, [11, 22]);
    }

    #[test]
    fn missing_residuals_are_errors() {
        let mut topology = testing::chain_topology(2, 1, &[2, 2], &[2, 2], 1);
        topology.layers[1].residual_source = Some(0);
        let mut kernel = DotProductKernel::new(&topology);
        let mut out = [0u8; 2];
        assert!(kernel
            .apply_residual_and_quantize(1, &mut ResultSink::new(&mut out, None))
            .is_err());
    }
}
