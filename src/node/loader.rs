use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tracing::debug;

use super::{
    error::{Error, Result},
    storage::{self, Storage},
};

/// Bytes of the length prefix in front of every weight record.
const RECORD_HEADER: u64 = 4;

/// One run of quantized weights and where its result goes.
///
/// The kernel computes a single output byte from it: a dot product of
/// `weights` with the input starting at `input_offset`, plus `bias`, scaled by
/// `multiplier` and shifted to the output zero point.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct WeightEntry {
    pub output_index: u32,
    pub input_offset: u32,
    pub weights: Vec<i8>,
    pub bias: i32,
    pub multiplier: f32,
    /// Input, weight and output zero points.
    pub zero_points: [i32; 3],
}

/// All entries one kernel call needs. Standard and pooling layers have one
/// block; classifier layers have one per output segment, the final one marked
/// `last`.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct WeightBlock {
    pub layer: u32,
    pub last: bool,
    pub entries: Vec<WeightEntry>,
}

/// Reads weight blocks off storage in file order.
///
/// The cursor is the byte offset just past the previous block. It only moves
/// forward, so no layer ever re-reads bytes an earlier layer consumed.
#[derive(Clone, Debug)]
pub struct WeightStream {
    file_name: String,
    cursor: u64,
}

impl WeightStream {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self::with_cursor(file_name, 0)
    }

    /// Resumes a stream from a cursor persisted by an earlier pass.
    pub fn with_cursor(file_name: impl Into<String>, cursor: u64) -> Self {
        Self {
            file_name: file_name.into(),
            cursor,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Reads the block for `layer` at `cursor` without moving the stream.
    /// Returns the block and the cursor just past it.
    pub fn read_block<S: Storage>(
        &self,
        storage: &S,
        layer: usize,
        cursor: u64,
    ) -> Result<(WeightBlock, u64)> {
        let mut reader = storage::read_at(storage, &self.file_name, cursor)?;
        let short = |e: io::Error| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::ShortRead {
                name: self.file_name.clone(),
                offset: cursor,
            },
            _ => Error::Storage {
                name: self.file_name.clone(),
                source: e,
            },
        };

        let len = reader.read_u32::<LittleEndian>().map_err(short)? as usize;
        let mut record = Vec::new();
        record
            .try_reserve_exact(len)
            .map_err(|_| Error::Allocation {
                what: "weight record",
                bytes: len,
            })?;
        record.resize(len, 0);
        reader.read_exact(&mut record).map_err(short)?;

        let mut aligned = AlignedVec::with_capacity(len);
        aligned.extend_from_slice(&record);
        let block = from_bytes::<WeightBlock>(&aligned).map_err(|_| Error::CorruptRecord {
            name: self.file_name.clone(),
            offset: cursor,
        })?;
        if block.layer as usize != layer {
            return Err(Error::LayerMismatch {
                expected: layer,
                found: block.layer as usize,
            });
        }
        Ok((block, cursor + RECORD_HEADER + len as u64))
    }

    /// Reads the next block, which must belong to `layer`, and advances.
    pub fn next_block<S: Storage>(&mut self, storage: &S, layer: usize) -> Result<WeightBlock> {
        let (block, next) = self.read_block(storage, layer, self.cursor)?;
        debug!(
            "loaded {} weight entries for layer {} ({}..{})",
            block.entries.len(),
            layer,
            self.cursor,
            next
        );
        self.cursor = next;
        Ok(block)
    }
}

/// Appends weight blocks in the format [`WeightStream`] reads.
pub struct WeightWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> WeightWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    /// Writes one block and returns the offset it starts at.
    pub fn write_block(&mut self, block: &WeightBlock) -> io::Result<u64> {
        let bytes = to_bytes::<_, 4096>(block)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "could not serialize block"))?;
        let start = self.offset;
        self.inner.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.inner.write_all(&bytes)?;
        self.offset += RECORD_HEADER + bytes.len() as u64;
        Ok(start)
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Writes `blocks` as the whole of `name`.
pub fn write_weights<S: Storage>(storage: &S, name: &str, blocks: &[WeightBlock]) -> Result<()> {
    let wrap = |source| Error::Storage {
        name: name.to_string(),
        source,
    };
    let mut writer = WeightWriter::new(storage.create(name).map_err(wrap)?);
    for block in blocks {
        writer.write_block(block).map_err(wrap)?;
    }
    debug!(
        "wrote {} weight blocks ({} bytes) to {}",
        blocks.len(),
        writer.offset(),
        name
    );
    writer.finish().map_err(wrap)?;
    Ok(())
}
