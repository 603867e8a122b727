use std::{fmt, io};

use thiserror::Error;

use super::{config::NodeId, net::wire::MessageKind};

/// Every failure a node can run into. None of them are recoverable in place:
/// the controller stops at the first error and reports which stage failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("could not allocate {bytes} bytes for the {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("the {0} is not available")]
    MissingBuffer(&'static str),

    #[error("storage error on {name}: {source}")]
    Storage {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("short read on {name} at offset {offset}")]
    ShortRead { name: String, offset: u64 },

    #[error("corrupt record in {name} at offset {offset}")]
    CorruptRecord { name: String, offset: u64 },

    #[error("found weights for layer {found} where layer {expected} was expected")]
    LayerMismatch { expected: usize, found: usize },

    #[error("transport rejected a {kind:?} frame for {to}")]
    SendRejected { kind: MessageKind, to: String },

    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("frame of {0} bytes is too short to carry a header")]
    ShortFrame(usize),

    #[error("payload length {len} exceeds the frame's capacity of {capacity}")]
    PayloadOverflow { len: usize, capacity: usize },

    #[error("cannot retarget the framer with {0} payload bytes pending")]
    PendingPayload(usize),

    #[error("the framer has no destination")]
    NoTarget,

    #[error(
        "a {incoming} byte payload does not fit the {remaining} bytes left in layer {layer}'s input"
    )]
    InputOverrun {
        layer: usize,
        incoming: usize,
        remaining: usize,
    },

    #[error("node {0} cannot be encoded in a 128-bit destination mask")]
    NodeOutOfRange(NodeId),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("spill region: {0}")]
    Spill(String),

    #[error("kernel: {0}")]
    Kernel(String),

    #[error("drained {drained} result bytes, expected {expected}")]
    DrainMismatch { drained: usize, expected: usize },

    #[error("stop requested by the coordinator")]
    Stopped,

    #[error("layer {layer} failed while {stage}: {source}")]
    Layer {
        layer: usize,
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The step of the layer controller an error surfaced in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ReceivingInput,
    LoadingWeights,
    Computing,
    PostProcessing,
    Spilling,
    AwaitingPermission,
    FanningOut,
    Reporting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Stage::ReceivingInput => "receiving input",
            Stage::LoadingWeights => "loading weights",
            Stage::Computing => "computing",
            Stage::PostProcessing => "post-processing",
            Stage::Spilling => "spilling",
            Stage::AwaitingPermission => "awaiting permission",
            Stage::FanningOut => "fanning out",
            Stage::Reporting => "reporting",
        };
        f.write_str(stage)
    }
}

impl Error {
    /// Wraps the error with the layer and stage it happened in. Errors that
    /// already carry a location are left alone.
    pub fn at(self, layer: usize, stage: Stage) -> Self {
        match self {
            located @ Error::Layer { .. } => located,
            other => Error::Layer {
                layer,
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, skipping layer/stage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Layer { source, .. } => source.root(),
            other => other,
        }
    }
}

pub(crate) trait StageExt<T> {
    fn at(self, layer: usize, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn at(self, layer: usize, stage: Stage) -> Result<T> {
        self.map_err(|e| e.at(layer, stage))
    }
}

/// Reserves exactly `len` zeroed bytes, turning allocation failure into an
/// error instead of an abort.
pub(crate) fn try_zeroed(what: &'static str, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::Allocation { what, bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}
