//! SectionReader (`spec.md` §4.5): consumes a section's Head+Data chain as a
//! byte/bit stream.

use block_device::BlockDevice;

use crate::block::{BlockBody, NOBLOCK};
use crate::engine::{EngineInner, EngineState, Shared};
use crate::error::{EssError, EssResult};
use crate::stream::{RemainingBitsExpectation, StreamReader, StreamState};

pub struct SectionReader<D> {
    engine: Shared<D>,
    name: String,
    state: StreamState,
    current_block_idx: u16,
    /// Whether the current block's `nextBlock` is not [`NOBLOCK`], i.e. whether a
    /// further Data block follows the one `buffer` was filled from.
    has_next: bool,
    expected_seq: u16,
    buffer: Vec<u8>,
    pos: usize,
    pending_byte: Option<u8>,
    bit_buffer: u16,
    bits_in_buffer: u8,
    bytes_read: u64,
    bits_read: u64,
}

impl<D: BlockDevice> SectionReader<D> {
    pub(crate) fn open(engine: Shared<D>, name: String, head_idx: u16) -> EssResult<Self> {
        let (first_data_idx, has_next, payload) = {
            let mut inner = engine.lock().unwrap();
            Self::require_readable(&inner)?;
            let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?;
            let head = accessor.load_block(head_idx)?;
            let first_data_idx = head.header.next_block;
            let data = accessor.load_block(first_data_idx)?;
            let has_next = data.header.next_block != NOBLOCK;
            match data.body {
                BlockBody::Data { seq_nb, payload } => {
                    if seq_nb != 1 {
                        return Err(EssError::BlockLinkage {
                            reason: format!("first data block has seqNb {seq_nb}, expected 1"),
                            idx: first_data_idx,
                        });
                    }
                    (first_data_idx, has_next, payload)
                }
                _ => {
                    return Err(EssError::BlockLinkage {
                        reason: "head does not reference a Data block".into(),
                        idx: first_data_idx,
                    })
                }
            }
        };
        let at_end = payload.is_empty() && !has_next;
        let mut reader = SectionReader {
            engine,
            name,
            state: StreamState::Open,
            current_block_idx: first_data_idx,
            has_next,
            expected_seq: 1,
            buffer: payload,
            pos: 0,
            pending_byte: None,
            bit_buffer: 0,
            bits_in_buffer: 0,
            bytes_read: 0,
            bits_read: 0,
        };
        if at_end {
            reader.state = Self::end_state(&reader);
        }
        Ok(reader)
    }

    fn require_readable(inner: &EngineInner<D>) -> EssResult<()> {
        if matches!(inner.state, EngineState::RoMount | EngineState::Mounted) {
            Ok(())
        } else {
            Err(EssError::InsufficientState {
                current: inner.state.to_string(),
            })
        }
    }

    fn end_state(&self) -> StreamState {
        StreamState::Empty
    }

    fn next_raw_byte(&mut self) -> EssResult<u8> {
        if let Some(b) = self.pending_byte.take() {
            self.bytes_read += 1;
            return Ok(b);
        }
        match self.state {
            StreamState::Closed => return Err(EssError::ClosedStream),
            StreamState::Error => return Err(EssError::ErrorState),
            _ => {}
        }
        if self.pos >= self.buffer.len() {
            self.advance_block()?;
        }
        let b = self.buffer[self.pos];
        self.pos += 1;
        self.bytes_read += 1;
        Ok(b)
    }

    fn advance_block(&mut self) -> EssResult<()> {
        let mut inner = self.engine.lock().unwrap();
        Self::require_readable(&inner)?;
        let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: inner.state.to_string(),
        })?;
        let current = accessor.load_block(self.current_block_idx)?;
        let next_idx = current.header.next_block;
        if next_idx == NOBLOCK {
            self.state = StreamState::Error;
            return Err(EssError::EmptyStream);
        }
        let next_block = accessor.load_block(next_idx)?;
        let next_has_next = next_block.header.next_block != NOBLOCK;
        self.expected_seq = self.expected_seq.wrapping_add(1);
        match next_block.body {
            BlockBody::Data { seq_nb, payload } => {
                if seq_nb != self.expected_seq {
                    self.state = StreamState::Error;
                    return Err(EssError::BlockLinkage {
                        reason: format!("expected seqNb {}, found {seq_nb}", self.expected_seq),
                        idx: next_idx,
                    });
                }
                self.current_block_idx = next_idx;
                self.has_next = next_has_next;
                self.buffer = payload;
                self.pos = 0;
                Ok(())
            }
            _ => {
                self.state = StreamState::Error;
                Err(EssError::BlockLinkage {
                    reason: "successor block is not of type Data".into(),
                    idx: next_idx,
                })
            }
        }
    }

    /// Whether any whole unread byte remains: either still buffered in the current
    /// block, or carried by a further block this reader has not yet loaded.
    fn bytes_remain(&self) -> bool {
        self.pending_byte.is_some() || self.pos < self.buffer.len() || self.has_next
    }
}

impl<D: BlockDevice> StreamReader for SectionReader<D> {
    fn state(&self) -> StreamState {
        self.state
    }

    fn read_byte(&mut self) -> EssResult<u8> {
        self.bit_buffer = 0;
        self.bits_in_buffer = 0;
        self.next_raw_byte()
    }

    fn read_bytes(&mut self, n: usize) -> EssResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_byte()?);
        }
        Ok(out)
    }

    fn read_string(&mut self) -> EssResult<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_line(&mut self) -> EssResult<String> {
        let mut bytes = Vec::new();
        loop {
            self.bit_buffer = 0;
            self.bits_in_buffer = 0;
            let b = self.next_raw_byte()?;
            match b {
                0 | b'\n' => break,
                b'\r' => {
                    let peek = self.next_raw_byte();
                    match peek {
                        Ok(b'\n') => {}
                        Ok(other) => self.pending_byte = Some(other),
                        Err(_) => {}
                    }
                    break;
                }
                other => bytes.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_bits(&mut self, n: u8) -> EssResult<u8> {
        if n == 0 || n > 8 {
            return Err(EssError::LogicError {
                reason: format!("read_bits requires n in [1,8], got {n}"),
            });
        }
        if self.bits_in_buffer < n {
            let byte = self.next_raw_byte()?;
            self.bit_buffer |= (byte as u16) << self.bits_in_buffer;
            self.bits_in_buffer += 8;
        }
        let mask: u16 = (1u16 << n) - 1;
        let value = (self.bit_buffer & mask) as u8;
        self.bit_buffer >>= n;
        self.bits_in_buffer -= n;
        self.bits_read += n as u64;
        Ok(value)
    }

    fn skip(&mut self, mut n_bits: u64) -> EssResult<()> {
        while n_bits > 0 {
            let take = n_bits.min(8) as u8;
            self.read_bits(take)?;
            n_bits -= take as u64;
        }
        Ok(())
    }

    fn ensure_all_data_consumed(&mut self, expectation: RemainingBitsExpectation) -> EssResult<()> {
        match self.state {
            StreamState::Closed => return Err(EssError::ClosedStream),
            StreamState::Error => return Err(EssError::ErrorState),
            StreamState::Open | StreamState::Empty => {}
        }
        let bytes_remain = self.bytes_remain();
        let remaining = self.bits_in_buffer;
        let ok = match expectation {
            // Exact bit counts only make sense once every whole byte has been
            // consumed too (§4.5/§6.3; mirrors the original's `rdPtr == nullptr`
            // gate on every non-`sevenOrLess`/`moreThanSeven`/`any` expectation).
            RemainingBitsExpectation::Zero => !bytes_remain && remaining == 0,
            RemainingBitsExpectation::One => !bytes_remain && remaining == 1,
            RemainingBitsExpectation::Two => !bytes_remain && remaining == 2,
            RemainingBitsExpectation::Three => !bytes_remain && remaining == 3,
            RemainingBitsExpectation::Four => !bytes_remain && remaining == 4,
            RemainingBitsExpectation::Five => !bytes_remain && remaining == 5,
            RemainingBitsExpectation::Six => !bytes_remain && remaining == 6,
            RemainingBitsExpectation::Seven => !bytes_remain && remaining == 7,
            RemainingBitsExpectation::SevenOrLess => !bytes_remain,
            RemainingBitsExpectation::MoreThanSeven => bytes_remain,
            RemainingBitsExpectation::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(EssError::RemainingBits {
                reason: format!(
                    "{remaining} cached bit(s) and {} unread byte(s) did not match expectation {expectation:?}",
                    if bytes_remain { "some" } else { "no" }
                ),
            })
        }
    }

    fn close(&mut self) -> EssResult<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        let mut inner = self.engine.lock().unwrap();
        inner.locks.release_read(&self.name);
        self.state = StreamState::Closed;
        Ok(())
    }
}

impl<D> Drop for SectionReader<D> {
    fn drop(&mut self) {
        if self.state != StreamState::Closed {
            let mut inner = self.engine.lock().unwrap();
            inner.locks.release_read(&self.name);
        }
    }
}
