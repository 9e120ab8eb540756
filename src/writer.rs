//! SectionWriter (`spec.md` §4.6): produces a brand-new Head+Data chain for a
//! section, swapping it in for any existing chain only once the new one is
//! complete and durable.

use block_device::BlockDevice;

use crate::block::{Block, NOBLOCK};
use crate::engine::{EngineInner, EngineState, Shared};
use crate::error::{EssError, EssResult};
use crate::stream::{StreamState, StreamWriter};

/// Bytes of payload a Data block can hold, mirroring the literal in
/// `Engine::get_free_space` (header 10 + seqNb 2 + CRC 2 = 14 bytes of overhead).
const DATA_OVERHEAD: usize = 14;

pub struct SectionWriter<D> {
    engine: Shared<D>,
    name: String,
    state: StreamState,
    capacity: Option<usize>,
    buffer: Vec<u8>,
    current_idx: u16,
    current_seq: u16,
    current_prev_writes: u32,
    first_data_idx: u16,
    new_head_idx: u16,
    new_head_prev_writes: u32,
    existing_head_idx: Option<u16>,
    old_head_version: Option<u16>,
    /// Every block index reserved for this write (the new head plus every Data
    /// block allocated so far), with its last-known `totalNbOfWrites`. Freed back
    /// to the pool verbatim if the write is abandoned before `close()` succeeds.
    reserved: Vec<(u16, u32)>,
    bit_buffer: u16,
    bits_in_buffer: u8,
    bytes_written: u64,
    bits_written: u64,
}

impl<D: BlockDevice> SectionWriter<D> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        engine: Shared<D>,
        name: String,
        new_head_idx: u16,
        new_head_prev_writes: u32,
        first_data_idx: u16,
        first_data_prev_writes: u32,
        existing_head_idx: Option<u16>,
        old_head_version: Option<u16>,
    ) -> Self {
        SectionWriter {
            engine,
            name,
            state: StreamState::Open,
            capacity: None,
            buffer: Vec::new(),
            current_idx: first_data_idx,
            current_seq: 1,
            current_prev_writes: first_data_prev_writes,
            first_data_idx,
            new_head_idx,
            new_head_prev_writes,
            existing_head_idx,
            old_head_version,
            reserved: vec![
                (new_head_idx, new_head_prev_writes),
                (first_data_idx, first_data_prev_writes),
            ],
            bit_buffer: 0,
            bits_in_buffer: 0,
            bytes_written: 0,
            bits_written: 0,
        }
    }

    fn require_writable(inner: &EngineInner<D>) -> EssResult<()> {
        if inner.state == EngineState::Mounted {
            Ok(())
        } else {
            Err(EssError::InsufficientState {
                current: inner.state.to_string(),
            })
        }
    }

    fn require_open(&self) -> EssResult<()> {
        match self.state {
            StreamState::Open => Ok(()),
            StreamState::Closed => Err(EssError::ClosedStream),
            _ => Err(EssError::ErrorState),
        }
    }

    fn ensure_capacity(&mut self) -> EssResult<usize> {
        if let Some(c) = self.capacity {
            return Ok(c);
        }
        let inner = self.engine.lock().unwrap();
        Self::require_writable(&inner)?;
        let block_size = inner
            .accessor
            .as_ref()
            .ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?
            .block_size() as usize;
        let c = block_size.saturating_sub(DATA_OVERHEAD);
        self.capacity = Some(c);
        Ok(c)
    }

    fn update_reserved(&mut self, idx: u16, total_writes: u32) {
        if let Some(entry) = self.reserved.iter_mut().find(|e| e.0 == idx) {
            entry.1 = total_writes;
        }
    }

    /// Writes the accumulated buffer to `current_idx` as a Data block with the
    /// given `nextBlock`.
    fn store_current(&mut self, next: u16) -> EssResult<()> {
        let mut inner = self.engine.lock().unwrap();
        Self::require_writable(&inner)?;
        let idx = self.current_idx;
        let seq = self.current_seq;
        let prev_writes = self.current_prev_writes;
        let payload = self.buffer.clone();
        let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: inner.state.to_string(),
        })?;
        let mut block = Block::new_data(seq, payload, next, prev_writes);
        let result = accessor.store_block(idx, &mut block);
        let new_total = block.header.total_nb_of_writes;
        match inner.mark_defect_on(result) {
            Ok(()) => {
                self.current_prev_writes = new_total;
                self.update_reserved(idx, new_total);
                Ok(())
            }
            Err(e) => {
                self.state = StreamState::Error;
                Err(e)
            }
        }
    }

    /// Finalizes the current (full) block, allocates the next one, patches the
    /// previous block's `nextBlock` to point at it, and resets the buffer. The new
    /// block is allocated and linked only after the full one is durably stored, so
    /// a crash never leaves a `nextBlock` pointing at an address that was never
    /// written (mirrors the tail-patch order in `FreeBlockList::append_chunk`).
    fn roll_to_next_block(&mut self) -> EssResult<()> {
        self.store_current(NOBLOCK)?;

        let mut inner = self.engine.lock().unwrap();
        Self::require_writable(&inner)?;
        let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: inner.state.to_string(),
        })?;
        let allocated = inner.free_list.alloc_one(accessor);
        let allocated = inner.mark_defect_on(allocated);
        let (new_idx, new_prev_writes) = match allocated {
            Ok(Some(v)) => v,
            Ok(None) => {
                self.state = StreamState::Error;
                return Err(EssError::InsufficientSpace);
            }
            Err(e) => {
                self.state = StreamState::Error;
                return Err(e);
            }
        };

        let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: inner.state.to_string(),
        })?;
        let mut prev_block = accessor.load_block(self.current_idx)?;
        prev_block.header.next_block = new_idx;
        let result = accessor.store_block(self.current_idx, &mut prev_block);
        let prev_new_total = prev_block.header.total_nb_of_writes;
        if let Err(e) = inner.mark_defect_on(result) {
            self.state = StreamState::Error;
            return Err(e);
        }
        self.update_reserved(self.current_idx, prev_new_total);

        self.reserved.push((new_idx, new_prev_writes));
        self.current_idx = new_idx;
        self.current_prev_writes = new_prev_writes;
        self.current_seq = self.current_seq.wrapping_add(1);
        self.buffer.clear();
        Ok(())
    }

    /// Pushes one byte onto the current Data block's buffer, rolling to a freshly
    /// allocated block first if it's full. Used directly by the bit-cache drain in
    /// `write_bits` so that flushing a completed byte group never re-enters the
    /// pending-bit flush in [`StreamWriter::write_byte`].
    fn push_raw_byte(&mut self, b: u8) -> EssResult<()> {
        let capacity = self.ensure_capacity()?;
        if self.buffer.len() == capacity {
            self.roll_to_next_block()?;
        }
        self.buffer.push(b);
        self.bytes_written += 1;
        Ok(())
    }

    fn close_success(&mut self) -> EssResult<()> {
        if self.bits_in_buffer > 0 {
            self.align_to_byte_boundary(0)?;
        }
        self.store_current(NOBLOCK)?;

        let version = self.old_head_version.map(|v| v.wrapping_add(1)).unwrap_or(0);
        let mut inner = self.engine.lock().unwrap();
        Self::require_writable(&inner)?;
        let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: inner.state.to_string(),
        })?;
        let mut head = Block::new_head(&self.name, version, self.first_data_idx, self.new_head_prev_writes);
        let result = accessor.store_block(self.new_head_idx, &mut head);
        if let Err(e) = inner.mark_defect_on(result) {
            self.state = StreamState::Error;
            return Err(e);
        }

        if let Some(old_idx) = self.existing_head_idx {
            let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?;
            let result = inner.free_list.free_chain(accessor, old_idx, NOBLOCK);
            if let Err(e) = inner.mark_defect_on(result) {
                self.state = StreamState::Error;
                return Err(e);
            }
        }

        inner.locks.release_write(&self.name);
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Returns every block reserved for this (abandoned) write to the free list
    /// and releases the section's write lock.
    fn close_abort(&mut self) -> EssResult<()> {
        let mut inner = self.engine.lock().unwrap();
        let cleanup = match inner.accessor.as_mut() {
            Some(accessor) => {
                let entries = self.reserved.clone();
                inner.free_list.free_many(accessor, &entries, 8)
            }
            None => Ok(()),
        };
        let cleanup = inner.mark_defect_on(cleanup);
        inner.locks.release_write(&self.name);
        self.state = StreamState::Closed;
        cleanup
    }
}

impl<D: BlockDevice> StreamWriter for SectionWriter<D> {
    fn state(&self) -> StreamState {
        self.state
    }

    fn write_byte(&mut self, b: u8) -> EssResult<()> {
        self.require_open()?;
        if self.bits_in_buffer > 0 {
            // Flush whatever's cached first, zero-padding the high bits (§4.6),
            // so a byte-level write never silently reorders ahead of pending bits.
            let pad_byte = (self.bit_buffer & 0xFF) as u8;
            self.bit_buffer = 0;
            self.bits_in_buffer = 0;
            self.push_raw_byte(pad_byte)?;
        }
        self.push_raw_byte(b)
    }

    fn write_bits(&mut self, value: u8, n: u8) -> EssResult<()> {
        self.require_open()?;
        if n == 0 || n > 8 {
            return Err(EssError::LogicError {
                reason: format!("write_bits requires n in [1,8], got {n}"),
            });
        }
        let mask: u16 = (1u16 << n) - 1;
        self.bit_buffer |= ((value as u16) & mask) << self.bits_in_buffer;
        self.bits_in_buffer += n;
        while self.bits_in_buffer >= 8 {
            let byte = (self.bit_buffer & 0xFF) as u8;
            self.bit_buffer >>= 8;
            self.bits_in_buffer -= 8;
            self.push_raw_byte(byte)?;
        }
        self.bits_written += n as u64;
        Ok(())
    }

    fn align_to_byte_boundary(&mut self, pad: u8) -> EssResult<()> {
        self.require_open()?;
        if self.bits_in_buffer == 0 {
            return Ok(());
        }
        let remaining = 8 - self.bits_in_buffer;
        let fill: u8 = if pad != 0 { ((1u16 << remaining) - 1) as u8 } else { 0 };
        self.write_bits(fill, remaining)
    }

    fn close(&mut self) -> EssResult<()> {
        match self.state {
            StreamState::Closed => Ok(()),
            StreamState::Open => self.close_success(),
            _ => self.close_abort(),
        }
    }
}

impl<D: BlockDevice> Drop for SectionWriter<D> {
    fn drop(&mut self) {
        if self.state != StreamState::Closed {
            let _ = self.close();
        }
    }
}
