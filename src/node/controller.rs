use std::time::{Duration, Instant};

use tracing::{debug, debug_span, info};

use super::{
    config::NodeConfig,
    error::{Error, Result, Stage, StageExt},
    kernel::{Kernel, ResultSink},
    loader::{WeightBlock, WeightStream},
    mapping::{self, Element},
    net::{Destination, Framer, Inbox, InputBuffer, MessageKind, Transport},
    observe::{LayerObserver, MemoryGauge, NoopObserver, WaitPhase},
    spill::{ResultBuffer, ResultDrain, SpillManager},
    storage::Storage,
    topology::{LayerKind, Topology},
    wait::{BusyPoll, Waiter},
};

/// Where a node is in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerState {
    /// Compute, then fan out to the next layer's consumers.
    Standard(usize),
    /// Compute, then send the output to the coordinator for pooling.
    Terminal(usize),
    /// Compute segment by segment, then send the final result to the
    /// coordinator.
    ClassifierSegment(usize),
    Finished,
}

impl LayerState {
    fn of(topology: &Topology, layer: usize) -> Self {
        if layer >= topology.len() {
            return LayerState::Finished;
        }
        match topology.kind(layer) {
            LayerKind::Standard => LayerState::Standard(layer),
            LayerKind::Terminal => LayerState::Terminal(layer),
            LayerKind::Classifier => LayerState::ClassifierSegment(layer),
        }
    }

    pub fn layer(&self) -> Option<usize> {
        match *self {
            LayerState::Standard(j)
            | LayerState::Terminal(j)
            | LayerState::ClassifierSegment(j) => Some(j),
            LayerState::Finished => None,
        }
    }
}

/// One worker node: runs every layer of its slice of the network in order.
///
/// The node owns all of its buffers. At any time it holds at most one input
/// buffer (the current layer's, or the next one's once the kernel has run),
/// one on-chip result buffer and one overflow region.
pub struct Node<T, S: Storage, K, W = BusyPoll, O = NoopObserver> {
    config: NodeConfig,
    topology: Topology,
    transport: T,
    storage: S,
    kernel: K,
    waiter: W,
    observer: O,
    gauge: MemoryGauge,
    weights: WeightStream,
    spill: SpillManager<S>,
    inbox: Inbox,
    framer: Framer,
    input: Option<InputBuffer>,
    state: LayerState,
}

impl<T, S, K> Node<T, S, K>
where
    T: Transport,
    S: Storage,
    K: Kernel,
{
    pub fn new(
        config: NodeConfig,
        topology: Topology,
        transport: T,
        storage: S,
        kernel: K,
    ) -> Result<Self> {
        config.validate()?;
        topology.validate()?;
        let gauge = MemoryGauge::new();
        let input = InputBuffer::allocate(0, topology.input_length(0)?, &gauge)
            .at(0, Stage::ReceivingInput)?;
        Ok(Self {
            weights: WeightStream::new(config.weights_file.clone()),
            spill: SpillManager::new(config.spill_file.clone(), gauge.clone()),
            framer: Framer::new(config.node_id, config.message_size),
            inbox: Inbox::new(config.coordinator_id),
            input: Some(input),
            state: LayerState::of(&topology, 0),
            waiter: BusyPoll::default(),
            observer: NoopObserver,
            gauge,
            config,
            topology,
            transport,
            storage,
            kernel,
        })
    }
}

impl<T, S: Storage, K, W, O> Node<T, S, K, W, O> {
    pub fn with_waiter<W2: Waiter>(self, waiter: W2) -> Node<T, S, K, W2, O> {
        self.replace_hooks(|_, observer| (waiter, observer))
    }

    pub fn with_observer<O2: LayerObserver>(self, observer: O2) -> Node<T, S, K, W, O2> {
        self.replace_hooks(|waiter, _| (waiter, observer))
    }

    fn replace_hooks<W2, O2>(self, f: impl FnOnce(W, O) -> (W2, O2)) -> Node<T, S, K, W2, O2> {
        let (waiter, observer) = f(self.waiter, self.observer);
        Node {
            config: self.config,
            topology: self.topology,
            transport: self.transport,
            storage: self.storage,
            kernel: self.kernel,
            waiter,
            observer,
            gauge: self.gauge,
            weights: self.weights,
            spill: self.spill,
            inbox: self.inbox,
            framer: self.framer,
            input: self.input,
            state: self.state,
        }
    }

    /// Restarts the node at `layer`, reading weights from `weight_cursor`.
    /// Whatever input was received for the old position is dropped, along
    /// with pending grants, unsent frame bytes and any half-drained spill.
    pub fn resume_at(&mut self, layer: usize, weight_cursor: u64) -> Result<()> {
        if layer >= self.topology.len() {
            return Err(Error::Topology(format!(
                "cannot resume at layer {} of a {} layer network",
                layer,
                self.topology.len()
            )));
        }
        self.input = None;
        self.spill.close();
        self.inbox = Inbox::new(self.config.coordinator_id);
        self.framer = Framer::new(self.config.node_id, self.config.message_size);
        self.input = Some(
            InputBuffer::allocate(layer, self.topology.input_length(layer)?, &self.gauge)
                .at(layer, Stage::ReceivingInput)?,
        );
        self.weights = WeightStream::with_cursor(self.config.weights_file.clone(), weight_cursor);
        self.state = LayerState::of(&self.topology, layer);
        debug!(
            "node {} resumes at layer {} from weight offset {}",
            self.config.node_id, layer, weight_cursor
        );
        Ok(())
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn gauge(&self) -> &MemoryGauge {
        &self.gauge
    }

    /// Byte offset of the next unread weight block.
    pub fn weight_cursor(&self) -> u64 {
        self.weights.cursor()
    }

    /// The input buffer currently being filled, if any.
    pub fn input(&self) -> Option<&InputBuffer> {
        self.input.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn into_observer(self) -> O {
        self.observer
    }
}

impl<T, S, K, W, O> Node<T, S, K, W, O>
where
    T: Transport,
    S: Storage,
    K: Kernel,
    W: Waiter,
    O: LayerObserver,
{
    /// Runs every remaining layer. The first failure stops the node.
    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        while self.state != LayerState::Finished {
            self.step()?;
        }
        let elapsed = started.elapsed();
        self.observer.inference_finished(elapsed);
        info!(
            "node {} finished inference in {:?} ({} frames sent, {} bytes received)",
            self.config.node_id,
            elapsed,
            self.framer.frames_sent(),
            self.inbox.bytes_received()
        );
        Ok(())
    }

    /// Runs the current layer and returns the state that follows it.
    pub fn step(&mut self) -> Result<LayerState> {
        let Some(layer) = self.state.layer() else {
            return Ok(LayerState::Finished);
        };
        let span = debug_span!("layer", node = self.config.node_id, index = layer);
        let _guard = span.enter();

        let started = Instant::now();
        self.observer.layer_started(layer);
        match self.state {
            LayerState::Standard(_) => self.run_standard(layer)?,
            LayerState::Terminal(_) => self.run_terminal(layer)?,
            LayerState::ClassifierSegment(_) => self.run_classifier(layer)?,
            LayerState::Finished => {}
        }
        self.observer.layer_finished(layer, started.elapsed());

        self.state = LayerState::of(&self.topology, layer + 1);
        Ok(self.state)
    }

    fn run_standard(&mut self, j: usize) -> Result<()> {
        self.receive_input(j)?;
        let block = self.load_weights(j)?;
        let on_chip = self.produce(j, &block)?;
        drop(block);
        self.release_input(j)?;
        self.await_permission(j)?;
        self.fan_out(j, &on_chip)?;
        drop(on_chip);
        self.report_complete(j)
    }

    fn run_terminal(&mut self, j: usize) -> Result<()> {
        self.receive_input(j)?;
        let block = self.load_weights(j)?;
        let on_chip = self.produce(j, &block)?;
        drop(block);
        self.release_input(j)?;
        self.await_permission(j)?;

        let result_length = self.topology.result_length(j)?;
        self.framer
            .target_coordinator(MessageKind::AdaptivePooling)
            .at(j, Stage::Reporting)?;
        let mut drain = ResultDrain::open(on_chip.as_slice(), &mut self.spill, &self.storage)
            .at(j, Stage::Spilling)?;
        for _ in 0..result_length {
            let byte = drain.next_byte().at(j, Stage::Spilling)?;
            self.framer
                .append(&mut self.transport, byte)
                .at(j, Stage::Reporting)?;
            self.inbox
                .drain_available(&mut self.transport, self.input.as_mut())
                .at(j, Stage::Reporting)?;
        }
        self.framer
            .flush_partial(&mut self.transport)
            .at(j, Stage::Reporting)?;
        drain.finish(result_length).at(j, Stage::Reporting)?;
        debug!("sent {} pooled bytes to the coordinator", result_length);
        drop(on_chip);
        self.report_complete(j)
    }

    fn run_classifier(&mut self, j: usize) -> Result<()> {
        self.receive_input(j)?;
        let result_length = self.topology.result_length(j)?;
        let segment = self.config.classifier_segment;
        let segments = result_length.div_ceil(segment);
        let mut result =
            ResultBuffer::allocate(result_length, &self.gauge).at(j, Stage::Computing)?;

        let input = self
            .input
            .as_ref()
            .ok_or(Error::MissingBuffer("input buffer"))
            .at(j, Stage::Computing)?;
        for s in 0..segments {
            let block = self
                .weights
                .next_block(&self.storage, j)
                .at(j, Stage::LoadingWeights)?;
            if block.last != (s + 1 == segments) {
                return Err(Error::Topology(format!(
                    "weight segment {} of {} is{} marked last",
                    s,
                    segments,
                    if block.last { "" } else { " not" }
                ))
                .at(j, Stage::LoadingWeights));
            }
            let range = s * segment..((s + 1) * segment).min(result_length);
            if let Some(stray) = block
                .entries
                .iter()
                .find(|e| !range.contains(&(e.output_index as usize)))
            {
                return Err(Error::Kernel(format!(
                    "segment {} covers outputs {:?} but has an entry for {}",
                    s, range, stray.output_index
                ))
                .at(j, Stage::Computing));
            }
            self.kernel
                .compute(
                    j,
                    &block.entries,
                    input.as_slice(),
                    &mut ResultSink::new(result.as_mut_slice(), None),
                )
                .at(j, Stage::Computing)?;
        }
        self.kernel
            .apply_residual_and_quantize(j, &mut ResultSink::new(result.as_mut_slice(), None))
            .at(j, Stage::PostProcessing)?;
        debug!("computed {} result bytes in {} segments", result_length, segments);

        self.release_input(j)?;
        self.framer
            .target_coordinator(MessageKind::InferenceResults)
            .at(j, Stage::Reporting)?;
        self.framer
            .extend(&mut self.transport, result.as_slice())
            .at(j, Stage::Reporting)?;
        self.framer
            .flush_partial(&mut self.transport)
            .at(j, Stage::Reporting)
    }

    fn receive_input(&mut self, j: usize) -> Result<()> {
        let started = Instant::now();
        let input = self
            .input
            .as_mut()
            .filter(|input| input.layer() == j)
            .ok_or(Error::MissingBuffer("input buffer"))
            .at(j, Stage::ReceivingInput)?;
        let target = input.len();
        self.inbox
            .wait_until(&mut self.transport, input, target, &mut self.waiter)
            .at(j, Stage::ReceivingInput)?;
        self.observer
            .waited(j, WaitPhase::Input, started.elapsed());
        debug!("received {} input bytes", target);
        Ok(())
    }

    fn load_weights(&mut self, j: usize) -> Result<WeightBlock> {
        self.weights
            .next_block(&self.storage, j)
            .at(j, Stage::LoadingWeights)
    }

    /// Runs the kernel and post-processing for a standard or terminal layer.
    /// Output past the stack size is staged in the spill region.
    fn produce(&mut self, j: usize, block: &WeightBlock) -> Result<ResultBuffer> {
        let result_length = self.topology.result_length(j)?;
        let stack_size = self.config.stack_size;
        let mut on_chip = ResultBuffer::allocate(result_length.min(stack_size), &self.gauge)
            .at(j, Stage::Computing)?;
        self.spill
            .begin_layer(result_length, stack_size)
            .at(j, Stage::Spilling)?;

        let input = self
            .input
            .as_ref()
            .ok_or(Error::MissingBuffer("input buffer"))
            .at(j, Stage::Computing)?;
        let mut sink = ResultSink::new(on_chip.as_mut_slice(), self.spill.region_mut());
        self.kernel
            .compute(j, &block.entries, input.as_slice(), &mut sink)
            .at(j, Stage::Computing)?;
        self.kernel
            .apply_residual_and_quantize(j, &mut sink)
            .at(j, Stage::PostProcessing)?;
        debug!(
            "computed {} result bytes, {} past the on-chip buffer",
            result_length,
            self.spill.len()
        );
        Ok(on_chip)
    }

    /// Frees the layer's input, moves any overflow to storage and opens the
    /// next layer's input buffer.
    fn release_input(&mut self, j: usize) -> Result<()> {
        self.input = None;
        self.spill.commit(&self.storage).at(j, Stage::Spilling)?;
        let next = j + 1;
        if next < self.topology.len() {
            let length = self.topology.input_length(next)?;
            let mut input = InputBuffer::allocate(next, length, &self.gauge)
                .at(next, Stage::ReceivingInput)?;
            self.inbox
                .drain_available(&mut self.transport, Some(&mut input))
                .at(next, Stage::ReceivingInput)?;
            self.input = Some(input);
        }
        Ok(())
    }

    fn await_permission(&mut self, j: usize) -> Result<()> {
        let started = Instant::now();
        self.inbox
            .wait_for_permission(&mut self.transport, self.input.as_mut(), &mut self.waiter)
            .at(j, Stage::AwaitingPermission)?;
        self.observer
            .waited(j, WaitPhase::Permission, started.elapsed());
        Ok(())
    }

    /// Sends layer `j`'s output to the consumers named by layer `j + 1`'s
    /// mapping, receiving whatever arrives between elements.
    fn fan_out(&mut self, j: usize, on_chip: &ResultBuffer) -> Result<()> {
        let mapping = mapping::resolve(&self.topology, j + 1).at(j, Stage::FanningOut)?;
        let result_length = self.topology.result_length(j)?;
        let mut receiving = Duration::ZERO;

        let mut drain = ResultDrain::open(on_chip.as_slice(), &mut self.spill, &self.storage)
            .at(j, Stage::Spilling)?;
        for group in &mapping.groups {
            self.framer
                .target_group(group.destinations.clone())
                .at(j, Stage::FanningOut)?;
            for element in group.elements(mapping.zero_point) {
                let byte = match element {
                    Element::Padding(zero_point) => zero_point,
                    Element::Output => drain.next_byte().at(j, Stage::Spilling)?,
                };
                self.framer
                    .append(&mut self.transport, byte)
                    .at(j, Stage::FanningOut)?;

                let started = Instant::now();
                self.inbox
                    .drain_available(&mut self.transport, self.input.as_mut())
                    .at(j, Stage::FanningOut)?;
                receiving += started.elapsed();
            }
            self.framer
                .flush_partial(&mut self.transport)
                .at(j, Stage::FanningOut)?;
            if self.inbox.stop_requested() {
                return Err(Error::Stopped.at(j, Stage::FanningOut));
            }
        }
        drain.finish(result_length).at(j, Stage::FanningOut)?;
        self.observer
            .waited(j, WaitPhase::FanOutReceive, receiving);
        debug!(
            "fanned out {} bytes in {} groups ({} elements)",
            result_length,
            mapping.groups.len(),
            mapping.total_len()
        );
        Ok(())
    }

    fn report_complete(&mut self, j: usize) -> Result<()> {
        self.framer
            .send_signal(
                &mut self.transport,
                &Destination::Coordinator,
                MessageKind::Complete,
            )
            .at(j, Stage::Reporting)
    }
}
