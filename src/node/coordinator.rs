use tracing::{debug, info, warn};

use super::{
    config::{NodeConfig, NodeId},
    error::{Error, Result, Stage, StageExt},
    net::{wire::Frame, Destination, Framer, MessageKind, Transport},
    wait::{BusyPoll, Waiter},
};

/// What one inference pass produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InferencePass {
    /// Output of the pooling layer, in worker order.
    pub pooled: Vec<u8>,
    /// Each worker's classifier output, in worker order.
    pub results: Vec<(NodeId, Vec<u8>)>,
}

impl InferencePass {
    /// All classifier output concatenated in worker order.
    pub fn logits(&self) -> Vec<u8> {
        self.results.iter().flat_map(|(_, r)| r.iter().copied()).collect()
    }
}

/// The node that feeds the mesh, paces it and gathers its results.
///
/// Send permission is handed to one worker at a time and the next grant only
/// goes out once that worker reports `Complete`. Every receiver therefore sees
/// its input arrive in worker order, which is what lets the mapping tables do
/// without offsets or sequence numbers.
pub struct Coordinator<T, W = BusyPoll> {
    workers: Vec<NodeId>,
    terminal_layer: usize,
    transport: T,
    framer: Framer,
    waiter: W,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(
        config: &NodeConfig,
        workers: Vec<NodeId>,
        terminal_layer: usize,
        transport: T,
    ) -> Result<Self> {
        config.validate()?;
        if workers.is_empty() {
            return Err(Error::Config("a mesh needs at least one worker".into()));
        }
        if workers.contains(&config.node_id) {
            return Err(Error::Config(format!(
                "coordinator {} cannot also be a worker",
                config.node_id
            )));
        }
        Ok(Self {
            workers,
            terminal_layer,
            transport,
            framer: Framer::new(config.node_id, config.message_size),
            waiter: BusyPoll::default(),
        })
    }
}

impl<T, W> Coordinator<T, W> {
    pub fn with_waiter<W2: Waiter>(self, waiter: W2) -> Coordinator<T, W2> {
        Coordinator {
            workers: self.workers,
            terminal_layer: self.terminal_layer,
            transport: self.transport,
            framer: self.framer,
            waiter,
        }
    }

    pub fn workers(&self) -> &[NodeId] {
        &self.workers
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport, W: Waiter> Coordinator<T, W> {
    /// Runs one pass: hands each worker its layer 0 input, paces every layer
    /// up to the pooling layer, broadcasts the pooled vector as the classifier
    /// input and waits for `classifier_lengths[i]` bytes from worker `i`.
    ///
    /// An empty `classifier_lengths` means the network ends at the pooling
    /// layer.
    pub fn run(
        &mut self,
        inputs: &[Vec<u8>],
        classifier_lengths: &[usize],
    ) -> Result<InferencePass> {
        if inputs.len() != self.workers.len() {
            return Err(Error::Config(format!(
                "{} inputs for {} workers",
                inputs.len(),
                self.workers.len()
            )));
        }
        if !classifier_lengths.is_empty() && classifier_lengths.len() != self.workers.len() {
            return Err(Error::Config(format!(
                "{} classifier lengths for {} workers",
                classifier_lengths.len(),
                self.workers.len()
            )));
        }

        for (&worker, input) in self.workers.iter().zip(inputs) {
            self.framer
                .target_group(vec![worker])
                .and_then(|_| self.framer.extend(&mut self.transport, input))
                .and_then(|_| self.framer.flush_partial(&mut self.transport))
                .at(0, Stage::FanningOut)?;
        }
        debug!("sent layer 0 input to {} workers", self.workers.len());

        let workers = self.workers.clone();
        for layer in 0..self.terminal_layer {
            for &worker in &workers {
                self.grant(worker, layer)?;
                self.await_complete(worker, layer, None)?;
            }
            debug!("layer {} done", layer);
        }

        let terminal = self.terminal_layer;
        let mut pooled = Vec::new();
        for &worker in &workers {
            self.grant(worker, terminal)?;
            self.await_complete(worker, terminal, Some(&mut pooled))?;
        }
        debug!("pooled {} bytes", pooled.len());

        let results = if classifier_lengths.is_empty() {
            Vec::new()
        } else {
            self.classify(&pooled, classifier_lengths)?
        };
        info!(
            "inference pass done: {} pooled bytes, {} result bytes",
            pooled.len(),
            results.iter().map(|(_, r)| r.len()).sum::<usize>()
        );
        Ok(InferencePass { pooled, results })
    }

    /// Tells every worker to abandon whatever it is waiting for.
    pub fn stop_all(&mut self) -> Result<()> {
        for &worker in &self.workers {
            self.framer.send_signal(
                &mut self.transport,
                &Destination::Nodes(vec![worker]),
                MessageKind::Stop,
            )?;
        }
        Ok(())
    }

    fn grant(&mut self, worker: NodeId, layer: usize) -> Result<()> {
        self.framer
            .send_signal(
                &mut self.transport,
                &Destination::Nodes(vec![worker]),
                MessageKind::Coordinator,
            )
            .at(layer, Stage::AwaitingPermission)
    }

    /// Waits for `worker`'s `Complete`, collecting any pooled bytes it sends
    /// first.
    fn await_complete(
        &mut self,
        worker: NodeId,
        layer: usize,
        mut pooled: Option<&mut Vec<u8>>,
    ) -> Result<()> {
        let transport = &mut self.transport;
        self.waiter
            .wait_until(|| {
                while let Some(raw) = transport.poll_frame() {
                    let frame = Frame::decode(raw)?;
                    match (frame.kind(), pooled.as_deref_mut()) {
                        (MessageKind::Complete, _) if frame.source() == worker => return Ok(true),
                        (MessageKind::AdaptivePooling, Some(pooled))
                            if frame.source() == worker =>
                        {
                            pooled.extend_from_slice(frame.payload())
                        }
                        (kind, _) => warn!(
                            "layer {}: ignoring {:?} from {} while waiting on {}",
                            layer,
                            kind,
                            frame.source(),
                            worker
                        ),
                    }
                }
                Ok(false)
            })
            .at(layer, Stage::Reporting)
    }

    fn classify(&mut self, pooled: &[u8], lengths: &[usize]) -> Result<Vec<(NodeId, Vec<u8>)>> {
        let layer = self.terminal_layer + 1;
        self.framer
            .target_group(self.workers.clone())
            .and_then(|_| self.framer.extend(&mut self.transport, pooled))
            .and_then(|_| self.framer.flush_partial(&mut self.transport))
            .at(layer, Stage::FanningOut)?;

        let mut results: Vec<(NodeId, Vec<u8>)> =
            self.workers.iter().map(|&w| (w, Vec::new())).collect();
        let transport = &mut self.transport;
        self.waiter
            .wait_until(|| {
                while let Some(raw) = transport.poll_frame() {
                    let frame = Frame::decode(raw)?;
                    let slot = results
                        .iter()
                        .position(|(w, _)| *w == frame.source());
                    match (frame.kind(), slot) {
                        (MessageKind::InferenceResults, Some(i)) => {
                            let remaining = lengths[i] - results[i].1.len();
                            if frame.payload().len() > remaining {
                                return Err(Error::InputOverrun {
                                    layer,
                                    incoming: frame.payload().len(),
                                    remaining,
                                });
                            }
                            results[i].1.extend_from_slice(frame.payload());
                        }
                        (kind, _) => warn!(
                            "ignoring {:?} from {} while collecting results",
                            kind,
                            frame.source()
                        ),
                    }
                }
                Ok(results
                    .iter()
                    .zip(lengths)
                    .all(|((_, r), &len)| r.len() == len))
            })
            .at(layer, Stage::Reporting)?;
        Ok(results)
    }
}
