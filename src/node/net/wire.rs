use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use crate::node::{
    config::NodeId,
    error::{Error, Result},
};

/// Bytes at the front of every frame that are not payload.
///
/// - byte 0: id of the sending node
/// - byte 1: [`MessageKind`] code
/// - bytes 2..4: payload length, u16 little endian
///
/// The payload follows in `[RESERVED_BYTES, message_size)`. Frames always go
/// out at their full fixed size; the length prefix says how much of the
/// payload region is meaningful.
pub const RESERVED_BYTES: usize = 4;

const SOURCE: usize = 0;
const KIND: usize = 1;
const LENGTH: usize = 2;

/// The closed set of frame kinds. The codes are shared by every node in the
/// mesh and must not be renumbered.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Layer output bound for the next layer's consumers
    Data = 0,
    /// Sent by the coordinator: permission for one fan-out
    Coordinator = 1,
    /// Sent by the coordinator: abandon the current pass
    Stop = 2,
    /// A node finished one layer's fan-out
    Complete = 3,
    /// Output of the pooling layer, bound for the coordinator
    AdaptivePooling = 4,
    /// Final classifier output, bound for the coordinator
    InferenceResults = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageKind::Data,
            1 => MessageKind::Coordinator,
            2 => MessageKind::Stop,
            3 => MessageKind::Complete,
            4 => MessageKind::AdaptivePooling,
            5 => MessageKind::InferenceResults,
            other => return Err(Error::UnknownMessageKind(other)),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

/// The decoded reserved bytes of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: NodeId,
    pub kind: MessageKind,
    pub payload_len: u16,
}

impl FrameHeader {
    /// Writes the header into the reserved bytes of `frame`.
    pub fn write(&self, frame: &mut [u8]) {
        frame[SOURCE] = self.source;
        frame[KIND] = self.kind.into();
        LittleEndian::write_u16(&mut frame[LENGTH..RESERVED_BYTES], self.payload_len);
    }

    /// Reads and validates the header of `frame`. The length prefix must fit
    /// inside the frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < RESERVED_BYTES {
            return Err(Error::ShortFrame(frame.len()));
        }
        let kind = MessageKind::try_from(frame[KIND])?;
        let payload_len = LittleEndian::read_u16(array_ref![frame, LENGTH, 2]);
        let capacity = frame.len() - RESERVED_BYTES;
        if payload_len as usize > capacity {
            return Err(Error::PayloadOverflow {
                len: payload_len as usize,
                capacity,
            });
        }
        Ok(Self {
            source: frame[SOURCE],
            kind,
            payload_len,
        })
    }
}

/// A received frame, header already validated.
#[derive(Clone, Debug)]
pub struct Frame {
    header: FrameHeader,
    buf: Vec<u8>,
}

impl Frame {
    pub fn decode(buf: Vec<u8>) -> Result<Self> {
        let header = FrameHeader::parse(&buf)?;
        Ok(Self { header, buf })
    }

    pub fn header(&self) -> FrameHeader {
        self.header
    }

    pub fn source(&self) -> NodeId {
        self.header.source
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// The meaningful part of the payload region.
    pub fn payload(&self) -> &[u8] {
        &self.buf[RESERVED_BYTES..RESERVED_BYTES + self.header.payload_len as usize]
    }
}

/// Builds a full-size frame around `payload`. Used by senders that have the
/// whole payload in hand; the framer fills its frame in place instead.
pub fn encode_frame(
    source: NodeId,
    kind: MessageKind,
    payload: &[u8],
    message_size: usize,
) -> Result<Vec<u8>> {
    let capacity = message_size.saturating_sub(RESERVED_BYTES);
    if payload.len() > capacity || payload.len() > u16::MAX as usize {
        return Err(Error::PayloadOverflow {
            len: payload.len(),
            capacity,
        });
    }
    let mut frame = vec![0u8; message_size];
    FrameHeader {
        source,
        kind,
        payload_len: payload.len() as u16,
    }
    .write(&mut frame);
    frame[RESERVED_BYTES..RESERVED_BYTES + payload.len()].copy_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_fixed() {
        let frame = encode_frame(9, MessageKind::AdaptivePooling, &[1, 2, 3], 12).unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..RESERVED_BYTES], &[9, 4, 3, 0]);
        assert_eq!(&frame[RESERVED_BYTES..RESERVED_BYTES + 3], &[1, 2, 3]);
    }

    #[test]
    fn kind_codes_are_stable() {
        let kinds = [
            MessageKind::Data,
            MessageKind::Coordinator,
            MessageKind::Stop,
            MessageKind::Complete,
            MessageKind::AdaptivePooling,
            MessageKind::InferenceResults,
        ];
        for (code, kind) in kinds.into_iter().enumerate() {
            assert_eq!(u8::from(kind), code as u8);
            assert_eq!(MessageKind::try_from(code as u8).unwrap(), kind);
        }
        assert!(matches!(
            MessageKind::try_from(6),
            Err(Error::UnknownMessageKind(6))
        ));
    }

    #[test]
    fn decode_exposes_only_the_prefixed_payload() {
        let raw = encode_frame(2, MessageKind::Data, &[7, 8], 16).unwrap();
        let frame = Frame::decode(raw).unwrap();
        assert_eq!(frame.source(), 2);
        assert_eq!(frame.kind(), MessageKind::Data);
        assert_eq!(frame.payload(), &[7, 8]);
    }

    #[test]
    fn rejects_lengths_past_the_frame() {
        let mut frame = vec![0u8; 8];
        FrameHeader {
            source: 1,
            kind: MessageKind::Data,
            payload_len: 5,
        }
        .write(&mut frame);
        assert!(matches!(
            FrameHeader::parse(&frame),
            Err(Error::PayloadOverflow { len: 5, capacity: 4 })
        ));
        assert!(matches!(FrameHeader::parse(&[0, 0]), Err(Error::ShortFrame(2))));
    }
}
