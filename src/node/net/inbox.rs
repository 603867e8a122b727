use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::{
    transport::Transport,
    wire::{Frame, MessageKind},
};
use crate::node::{
    config::NodeId,
    error::{try_zeroed, Error, Result},
    hex::HexDisplayExt,
    observe::MemoryGauge,
    wait::Waiter,
};

/// One layer's input, filled front to back as data frames arrive.
///
/// The buffer is charged to the memory gauge for as long as it lives and
/// released when dropped.
pub struct InputBuffer {
    layer: usize,
    data: Vec<u8>,
    received: usize,
    gauge: MemoryGauge,
}

impl InputBuffer {
    pub fn allocate(layer: usize, len: usize, gauge: &MemoryGauge) -> Result<Self> {
        let data = try_zeroed("input buffer", len)?;
        gauge.allocate(len);
        Ok(Self {
            layer,
            data,
            received: 0,
            gauge: gauge.clone(),
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.received
    }

    pub fn is_full(&self) -> bool {
        self.received == self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn push(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.remaining() {
            return Err(Error::InputOverrun {
                layer: self.layer,
                incoming: payload.len(),
                remaining: self.remaining(),
            });
        }
        self.data[self.received..self.received + payload.len()].copy_from_slice(payload);
        self.received += payload.len();
        Ok(())
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        self.gauge.release(self.data.len());
    }
}

/// Receiving side of a node.
///
/// Data payloads are appended to whichever input buffer the caller passes in.
/// Payloads that arrive once that buffer is full belong to a later layer and
/// are held back, in order, until the next buffer shows up. Permission grants
/// from the coordinator are counted so one that arrives early is not lost.
/// Grants and stops from any other node are dropped.
pub struct Inbox {
    coordinator: NodeId,
    backlog: VecDeque<Frame>,
    permits: usize,
    stop_requested: bool,
    bytes_received: u64,
}

impl Inbox {
    pub fn new(coordinator: NodeId) -> Self {
        Self {
            coordinator,
            backlog: VecDeque::new(),
            permits: 0,
            stop_requested: false,
            bytes_received: 0,
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Copies everything that is already available into `buffer` and returns
    /// the new fill level. Never blocks.
    pub fn drain_available<T: Transport>(
        &mut self,
        transport: &mut T,
        mut buffer: Option<&mut InputBuffer>,
    ) -> Result<usize> {
        if let Some(buffer) = buffer.as_deref_mut() {
            while !buffer.is_full() {
                let Some(frame) = self.backlog.pop_front() else {
                    break;
                };
                self.accept(frame, buffer)?;
            }
        }

        while let Some(raw) = transport.poll_frame() {
            let frame = Frame::decode(raw)?;
            trace!(
                "received {:?} from {} ({} bytes) {}",
                frame.kind(),
                frame.source(),
                frame.payload().len(),
                frame.payload().hex()
            );
            match frame.kind() {
                MessageKind::Data => match buffer.as_deref_mut() {
                    Some(buffer) if self.backlog.is_empty() && !buffer.is_full() => {
                        self.accept(frame, buffer)?
                    }
                    _ => self.backlog.push_back(frame),
                },
                MessageKind::Coordinator | MessageKind::Stop
                    if frame.source() != self.coordinator =>
                {
                    warn!(
                        "dropping {:?} from {}, which is not the coordinator",
                        frame.kind(),
                        frame.source()
                    )
                }
                MessageKind::Coordinator => {
                    self.permits += 1;
                    debug!("permission granted by {}", frame.source());
                }
                MessageKind::Stop => {
                    self.stop_requested = true;
                    debug!("stop requested by {}", frame.source());
                }
                other => warn!(
                    "ignoring unexpected {:?} frame from {}",
                    other,
                    frame.source()
                ),
            }
        }

        Ok(buffer.map_or(0, |buffer| buffer.received()))
    }

    /// Busy-polls until `buffer` holds `target` bytes.
    pub fn wait_until<T: Transport, W: Waiter>(
        &mut self,
        transport: &mut T,
        buffer: &mut InputBuffer,
        target: usize,
        waiter: &mut W,
    ) -> Result<usize> {
        if target > buffer.len() {
            return Err(Error::InputOverrun {
                layer: buffer.layer(),
                incoming: target,
                remaining: buffer.len(),
            });
        }
        waiter.wait_until(|| {
            let received = self.drain_available(transport, Some(&mut *buffer))?;
            if self.stop_requested {
                return Err(Error::Stopped);
            }
            Ok(received >= target)
        })?;
        Ok(buffer.received())
    }

    /// Busy-polls until the coordinator grants one fan-out, receiving into
    /// `buffer` in the meantime. Consumes the grant.
    pub fn wait_for_permission<T: Transport, W: Waiter>(
        &mut self,
        transport: &mut T,
        mut buffer: Option<&mut InputBuffer>,
        waiter: &mut W,
    ) -> Result<()> {
        waiter.wait_until(|| {
            self.drain_available(transport, buffer.as_deref_mut())?;
            if self.stop_requested {
                return Err(Error::Stopped);
            }
            Ok(self.permits > 0)
        })?;
        self.permits -= 1;
        Ok(())
    }

    fn accept(&mut self, frame: Frame, buffer: &mut InputBuffer) -> Result<()> {
        buffer.push(frame.payload())?;
        self.bytes_received += frame.payload().len() as u64;
        Ok(())
    }
}
