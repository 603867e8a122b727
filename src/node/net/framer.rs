use tracing::trace;

use super::{
    transport::{Destination, Transport},
    wire::{FrameHeader, MessageKind, RESERVED_BYTES},
};
use crate::node::{
    config::NodeId,
    error::{Error, Result},
    hex::HexDisplayExt,
};

/// Packs outgoing bytes into fixed-size frames.
///
/// The framer holds one frame. Bytes are appended to its payload region and
/// the frame goes out as soon as that region is full. Whatever is left at the
/// end of a unit of work is sent with [`Framer::flush_partial`]. A framer is
/// aimed at one destination at a time and refuses to be re-aimed while it
/// still holds unsent bytes.
pub struct Framer {
    node_id: NodeId,
    frame: Vec<u8>,
    filled: usize,
    kind: MessageKind,
    target: Option<Destination>,
    frames_sent: u64,
}

impl Framer {
    pub fn new(node_id: NodeId, message_size: usize) -> Self {
        let mut frame = vec![0u8; message_size];
        frame[0] = node_id;
        Self {
            node_id,
            frame,
            filled: 0,
            kind: MessageKind::Data,
            target: None,
            frames_sent: 0,
        }
    }

    pub fn payload_capacity(&self) -> usize {
        self.frame.len() - RESERVED_BYTES
    }

    /// Payload bytes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.filled
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Aims subsequent `Data` frames at a destination group.
    pub fn target_group(&mut self, destinations: Vec<NodeId>) -> Result<()> {
        self.retarget(Destination::Nodes(destinations), MessageKind::Data)
    }

    /// Aims subsequent frames of `kind` at the coordinator.
    pub fn target_coordinator(&mut self, kind: MessageKind) -> Result<()> {
        self.retarget(Destination::Coordinator, kind)
    }

    fn retarget(&mut self, to: Destination, kind: MessageKind) -> Result<()> {
        if self.filled != 0 {
            return Err(Error::PendingPayload(self.filled));
        }
        self.target = Some(to);
        self.kind = kind;
        Ok(())
    }

    /// Buffers one payload byte, sending the frame if that filled it.
    pub fn append<T: Transport>(&mut self, transport: &mut T, byte: u8) -> Result<()> {
        self.frame[RESERVED_BYTES + self.filled] = byte;
        self.filled += 1;
        if self.filled == self.payload_capacity() {
            self.flush(transport)?;
        }
        Ok(())
    }

    pub fn extend<T: Transport>(&mut self, transport: &mut T, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.payload_capacity() - self.filled;
            let take = room.min(rest.len());
            let start = RESERVED_BYTES + self.filled;
            self.frame[start..start + take].copy_from_slice(&rest[..take]);
            self.filled += take;
            rest = &rest[take..];
            if self.filled == self.payload_capacity() {
                self.flush(transport)?;
            }
        }
        Ok(())
    }

    /// Sends whatever payload is buffered. Does nothing when it is empty.
    pub fn flush_partial<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        if self.filled == 0 {
            return Ok(());
        }
        self.flush(transport)
    }

    /// Sends a payload-less frame of `kind` to `to`. The current target and
    /// kind are left untouched.
    pub fn send_signal<T: Transport>(
        &mut self,
        transport: &mut T,
        to: &Destination,
        kind: MessageKind,
    ) -> Result<()> {
        if self.filled != 0 {
            return Err(Error::PendingPayload(self.filled));
        }
        self.transmit(transport, to, kind)
    }

    fn flush<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let to = self.target.take().ok_or(Error::NoTarget)?;
        let sent = self.transmit(transport, &to, self.kind);
        self.target = Some(to);
        sent?;
        self.filled = 0;
        Ok(())
    }

    fn transmit<T: Transport>(
        &mut self,
        transport: &mut T,
        to: &Destination,
        kind: MessageKind,
    ) -> Result<()> {
        FrameHeader {
            source: self.node_id,
            kind,
            payload_len: self.filled as u16,
        }
        .write(&mut self.frame);
        trace!(
            "frame {:?} -> {} ({} bytes) {}",
            kind,
            to,
            self.filled,
            self.frame[RESERVED_BYTES..RESERVED_BYTES + self.filled].hex()
        );
        if !transport.send(to, &self.frame) {
            return Err(Error::SendRejected {
                kind,
                to: to.to_string(),
            });
        }
        self.frames_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{net::wire::Frame, testing::ScriptedTransport};

    fn decode(frames: &[(Destination, Vec<u8>)]) -> Vec<(Destination, MessageKind, Vec<u8>)> {
        frames
            .iter()
            .map(|(to, raw)| {
                let frame = Frame::decode(raw.clone()).unwrap();
                (to.clone(), frame.kind(), frame.payload().to_vec())
            })
            .collect()
    }

    #[test]
    fn flushes_exactly_when_the_payload_fills() {
        let mut transport = ScriptedTransport::default();
        let mut framer = Framer::new(4, RESERVED_BYTES + 3);
        framer.target_group(vec![1, 2]).unwrap();
        for byte in 0..7u8 {
            framer.append(&mut transport, byte).unwrap();
        }
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(framer.pending(), 1);
        framer.flush_partial(&mut transport).unwrap();

        let sent = decode(&transport.sent);
        let payloads: Vec<_> = sent.iter().map(|(_, _, p)| p.clone()).collect();
        assert_eq!(payloads, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(sent.iter().all(|(to, kind, _)| {
            *to == Destination::Nodes(vec![1, 2]) && *kind == MessageKind::Data
        }));
        assert!(transport
            .sent
            .iter()
            .all(|(_, raw)| raw[0] == 4 && raw.len() == RESERVED_BYTES + 3));
    }

    #[test]
    fn empty_partial_flush_sends_nothing() {
        let mut transport = ScriptedTransport::default();
        let mut framer = Framer::new(1, 16);
        framer.target_coordinator(MessageKind::AdaptivePooling).unwrap();
        framer.flush_partial(&mut transport).unwrap();
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn extend_matches_byte_by_byte_appends() {
        let mut a = ScriptedTransport::default();
        let mut b = ScriptedTransport::default();
        let bytes: Vec<u8> = (0..23).collect();

        let mut framer = Framer::new(1, RESERVED_BYTES + 5);
        framer.target_coordinator(MessageKind::InferenceResults).unwrap();
        framer.extend(&mut a, &bytes).unwrap();
        framer.flush_partial(&mut a).unwrap();

        let mut framer = Framer::new(1, RESERVED_BYTES + 5);
        framer.target_coordinator(MessageKind::InferenceResults).unwrap();
        for byte in &bytes {
            framer.append(&mut b, *byte).unwrap();
        }
        framer.flush_partial(&mut b).unwrap();

        assert_eq!(a.sent, b.sent);
        assert_eq!(a.sent.len(), 5);
    }

    #[test]
    fn refuses_to_retarget_with_pending_bytes() {
        let mut transport = ScriptedTransport::default();
        let mut framer = Framer::new(1, 16);
        framer.target_group(vec![2]).unwrap();
        framer.append(&mut transport, 9).unwrap();
        assert!(matches!(framer.target_group(vec![3]), Err(Error::PendingPayload(1))));
        assert!(matches!(
            framer.send_signal(&mut transport, &Destination::Coordinator, MessageKind::Complete),
            Err(Error::PendingPayload(1))
        ));
        framer.flush_partial(&mut transport).unwrap();
        framer.target_group(vec![3]).unwrap();
    }

    #[test]
    fn rejected_sends_are_errors() {
        let mut transport = ScriptedTransport::default();
        transport.reject_sends = true;
        let mut framer = Framer::new(1, RESERVED_BYTES + 1);
        framer.target_group(vec![2]).unwrap();
        assert!(matches!(
            framer.append(&mut transport, 1),
            Err(Error::SendRejected { kind: MessageKind::Data, .. })
        ));
    }

    #[test]
    fn flushing_without_a_target_fails() {
        let mut transport = ScriptedTransport::default();
        let mut framer = Framer::new(1, RESERVED_BYTES + 1);
        assert!(matches!(framer.append(&mut transport, 1), Err(Error::NoTarget)));
    }

    #[test]
    fn signals_carry_no_payload() {
        let mut transport = ScriptedTransport::default();
        let mut framer = Framer::new(6, 16);
        framer
            .send_signal(&mut transport, &Destination::Coordinator, MessageKind::Complete)
            .unwrap();
        let sent = decode(&transport.sent);
        assert_eq!(sent, vec![(Destination::Coordinator, MessageKind::Complete, vec![])]);
    }
}
