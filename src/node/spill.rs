use std::io::BufReader;

use byteorder::ReadBytesExt;
use tracing::debug;

use super::{
    error::{try_zeroed, Error, Result},
    observe::MemoryGauge,
    storage::{self, Storage},
};

/// The part of a layer's output past the on-chip capacity, staged in memory
/// while the kernel writes it.
pub struct OverflowRegion {
    data: Vec<u8>,
}

impl OverflowRegion {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Writes `bytes` at `offset`, relative to the first byte past the
    /// on-chip capacity.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Spill(format!(
                    "write of {} bytes at {} runs past the {} byte region",
                    bytes.len(),
                    offset,
                    self.data.len()
                ))
            })?;
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// The on-chip part of a layer's output, charged to the memory gauge while
/// it lives.
pub struct ResultBuffer {
    data: Vec<u8>,
    gauge: MemoryGauge,
}

impl ResultBuffer {
    pub fn allocate(len: usize, gauge: &MemoryGauge) -> Result<Self> {
        let data = try_zeroed("result buffer", len)?;
        gauge.allocate(len);
        Ok(Self {
            data,
            gauge: gauge.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for ResultBuffer {
    fn drop(&mut self) {
        self.gauge.release(self.data.len());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillPhase {
    /// No overflow for the current layer.
    Idle,
    /// The kernel is producing into the staged region.
    Writing,
    /// The region is on storage, waiting for fan-out.
    Committed,
    /// Fan-out is reading the spill file back.
    Reading,
}

/// Owns a layer's overflow from production to transmission.
///
/// A layer that overflows goes through every phase exactly once:
/// `begin_layer` stages a region, the kernel writes it, `commit` moves it to
/// the spill file and frees the memory, `open_reader` starts fan-out and
/// `read_sequential` hands bytes back in production order until `close`.
pub struct SpillManager<S: Storage> {
    file_name: String,
    phase: SpillPhase,
    region: Option<OverflowRegion>,
    reader: Option<BufReader<S::Reader>>,
    len: usize,
    drained: usize,
    gauge: MemoryGauge,
}

impl<S: Storage> SpillManager<S> {
    pub fn new(file_name: impl Into<String>, gauge: MemoryGauge) -> Self {
        Self {
            file_name: file_name.into(),
            phase: SpillPhase::Idle,
            region: None,
            reader: None,
            len: 0,
            drained: 0,
            gauge,
        }
    }

    pub fn phase(&self) -> SpillPhase {
        self.phase
    }

    /// Size of the current layer's overflow.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Prepares for a layer producing `result_length` bytes. Returns whether
    /// any of it spills past `stack_size`.
    pub fn begin_layer(&mut self, result_length: usize, stack_size: usize) -> Result<bool> {
        if self.phase != SpillPhase::Idle {
            return Err(Error::Spill(format!(
                "cannot begin a layer while {:?}",
                self.phase
            )));
        }
        let excess = result_length.saturating_sub(stack_size);
        self.len = excess;
        self.drained = 0;
        if excess == 0 {
            return Ok(false);
        }
        let data = try_zeroed("overflow region", excess)?;
        self.gauge.allocate(excess);
        self.region = Some(OverflowRegion { data });
        self.phase = SpillPhase::Writing;
        debug!("{} result bytes overflow the on-chip buffer", excess);
        Ok(true)
    }

    /// The staged region, while the kernel may write it.
    pub fn region_mut(&mut self) -> Option<&mut OverflowRegion> {
        match self.phase {
            SpillPhase::Writing => self.region.as_mut(),
            _ => None,
        }
    }

    pub fn write_overflow(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let phase = self.phase;
        self.region_mut()
            .ok_or_else(|| Error::Spill(format!("cannot write overflow while {:?}", phase)))?
            .write(offset, bytes)
    }

    /// Moves the staged region to the spill file and frees it. Does nothing
    /// for a layer without overflow.
    pub fn commit(&mut self, storage: &S) -> Result<()> {
        match self.phase {
            SpillPhase::Idle => return Ok(()),
            SpillPhase::Writing => {}
            other => {
                return Err(Error::Spill(format!("cannot commit while {:?}", other)));
            }
        }
        let region = self
            .region
            .take()
            .ok_or(Error::MissingBuffer("overflow region"))?;
        storage::write_all(storage, &self.file_name, &region.data)?;
        self.gauge.release(region.data.len());
        self.phase = SpillPhase::Committed;
        debug!("spilled {} bytes to {}", region.data.len(), self.file_name);
        Ok(())
    }

    /// Opens the spill file for fan-out. Does nothing for a layer without
    /// overflow.
    pub fn open_reader(&mut self, storage: &S) -> Result<()> {
        match self.phase {
            SpillPhase::Idle => return Ok(()),
            SpillPhase::Committed => {}
            other => {
                return Err(Error::Spill(format!("cannot open the reader while {:?}", other)));
            }
        }
        let reader = storage::read_at(storage, &self.file_name, 0)?;
        self.reader = Some(BufReader::new(reader));
        self.phase = SpillPhase::Reading;
        Ok(())
    }

    /// The next overflow byte in production order.
    pub fn read_sequential(&mut self) -> Result<u8> {
        if self.drained == self.len {
            return Err(Error::Spill(format!(
                "all {} overflow bytes were already read",
                self.len
            )));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| Error::Spill("the spill file is not open".into()))?;
        let byte = reader.read_u8().map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::ShortRead {
                name: self.file_name.clone(),
                offset: self.drained as u64,
            },
            _ => Error::Storage {
                name: self.file_name.clone(),
                source: e,
            },
        })?;
        self.drained += 1;
        Ok(byte)
    }

    /// Ends the layer's spill, releasing the reader. Returns the bytes read
    /// back.
    pub fn close(&mut self) -> usize {
        self.reader = None;
        if let Some(region) = self.region.take() {
            self.gauge.release(region.data.len());
        }
        self.phase = SpillPhase::Idle;
        self.drained
    }
}

/// Hands out a layer's output in order: the on-chip bytes first, then the
/// overflow read back from the spill file.
pub struct ResultDrain<'a, S: Storage> {
    on_chip: &'a [u8],
    spill: &'a mut SpillManager<S>,
    next: usize,
}

impl<'a, S: Storage> ResultDrain<'a, S> {
    pub fn open(on_chip: &'a [u8], spill: &'a mut SpillManager<S>, storage: &S) -> Result<Self> {
        spill.open_reader(storage)?;
        Ok(Self {
            on_chip,
            spill,
            next: 0,
        })
    }

    pub fn next_byte(&mut self) -> Result<u8> {
        let byte = if self.next < self.on_chip.len() {
            self.on_chip[self.next]
        } else {
            self.spill.read_sequential()?
        };
        self.next += 1;
        Ok(byte)
    }

    /// Closes the spill and checks that exactly `expected` bytes went out.
    pub fn finish(self, expected: usize) -> Result<()> {
        self.spill.close();
        if self.next != expected {
            return Err(Error::DrainMismatch {
                drained: self.next,
                expected,
            });
        }
        Ok(())
    }
}
