//! FreeBlockList (`spec.md` §4.2): head/tail/count cache over the on-media free
//! singly-linked list, with transactional backup/restore.

use block_device::BlockDevice;
use log::debug;

use crate::block::{Block, BlockAccessor, BlockBody, NOBLOCK};
use crate::error::{EssError, EssResult};

const DEFAULT_CHUNK_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct FreeListSnapshot {
    count: u32,
    head: u16,
    tail: u16,
}

#[derive(Debug, Clone)]
pub struct FreeBlockList {
    count: u32,
    head: u16,
    tail: u16,
}

impl FreeBlockList {
    pub fn new(count: u32, head: u16, tail: u16) -> Self {
        Self { count, head, tail }
    }

    pub fn empty() -> Self {
        Self {
            count: 0,
            head: NOBLOCK,
            tail: NOBLOCK,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn tail(&self) -> u16 {
        self.tail
    }

    pub fn backup(&self) -> FreeListSnapshot {
        FreeListSnapshot {
            count: self.count,
            head: self.head,
            tail: self.tail,
        }
    }

    pub fn restore(&mut self, snap: FreeListSnapshot) {
        self.count = snap.count;
        self.head = snap.head;
        self.tail = snap.tail;
    }

    /// Unlinks the head of the free list without mutating media. Returns the
    /// freed index and its previous write counter, so the caller may continue it.
    pub fn alloc_one<D: BlockDevice>(&mut self, accessor: &mut BlockAccessor<D>) -> EssResult<Option<(u16, u32)>> {
        if self.count == 0 {
            return Ok(None);
        }
        let idx = self.head;
        let prev_writes = accessor.load_field_total_nb_of_writes(idx)?;
        let next = accessor.load_field_next_block(idx)?;
        self.count -= 1;
        self.head = next;
        if self.count == 0 {
            self.tail = NOBLOCK;
        }
        Ok(Some((idx, prev_writes)))
    }

    /// Unlinks `n` consecutive entries without writing to media. Wrapped in a
    /// snapshot (§4.6 "each allocation is wrapped in a FreeBlockList snapshot") so
    /// that an I/O error reading a later entry's header leaves the cache exactly as
    /// it was before this call, rather than partially unlinked.
    pub fn alloc_n<D: BlockDevice>(
        &mut self,
        accessor: &mut BlockAccessor<D>,
        n: usize,
    ) -> EssResult<Option<Vec<(u16, u32)>>> {
        if (self.count as usize) < n {
            return Ok(None);
        }
        let snap = self.backup();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc_one(accessor) {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => unreachable!("count underflow during alloc_n"),
                Err(e) => {
                    self.restore(snap);
                    return Err(e);
                }
            }
        }
        Ok(Some(out))
    }

    /// Appends one block to the tail, writing a Free header and patching the
    /// previous tail's `nextBlock`.
    pub fn free_one<D: BlockDevice>(
        &mut self,
        accessor: &mut BlockAccessor<D>,
        idx: u16,
        prev_total_writes: u32,
    ) -> EssResult<()> {
        self.append_chunk(accessor, &[(idx, prev_total_writes)])
    }

    /// Appends an explicit list of `(idx, prev_total_writes)` entries, chunked to
    /// minimize tail-patch writes.
    pub fn free_many<D: BlockDevice>(
        &mut self,
        accessor: &mut BlockAccessor<D>,
        entries: &[(u16, u32)],
        chunk_size: usize,
    ) -> EssResult<()> {
        for chunk in entries.chunks(chunk_size.max(1)) {
            self.append_chunk(accessor, chunk)?;
        }
        Ok(())
    }

    /// Walks a section chain (Head or Data) from `start_idx`, validating type and
    /// seqNb continuity, and appends every visited block to the free list in chunks
    /// of up to 8, stopping just before `stop_idx` (or at the natural chain end if
    /// `stop_idx` is [`NOBLOCK`]).
    pub fn free_chain<D: BlockDevice>(
        &mut self,
        accessor: &mut BlockAccessor<D>,
        start_idx: u16,
        stop_idx: u16,
    ) -> EssResult<()> {
        let mut collected = Vec::new();
        let mut idx = start_idx;
        let mut expected_seq: Option<u16> = None;
        loop {
            let block = accessor.load_block(idx)?;
            match &block.body {
                BlockBody::Head { .. } => {
                    expected_seq = Some(1);
                }
                BlockBody::Data { seq_nb, .. } => {
                    if let Some(expected) = expected_seq {
                        if *seq_nb != expected {
                            return Err(EssError::BlockLinkage {
                                reason: format!("expected seqNb {expected}, found {seq_nb}"),
                                idx,
                            });
                        }
                    }
                    expected_seq = Some(seq_nb.wrapping_add(1));
                }
                _ => {
                    return Err(EssError::BlockLinkage {
                        reason: "chain contains a non-Head/Data block".into(),
                        idx,
                    })
                }
            }
            collected.push((idx, block.header.total_nb_of_writes));
            let next = block.header.next_block;
            if next == stop_idx || next == NOBLOCK {
                break;
            }
            idx = next;
        }
        self.free_many(accessor, &collected, DEFAULT_CHUNK_SIZE)
    }

    fn append_chunk<D: BlockDevice>(
        &mut self,
        accessor: &mut BlockAccessor<D>,
        chunk: &[(u16, u32)],
    ) -> EssResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        for (pos, &(idx, prev_writes)) in chunk.iter().enumerate() {
            let next = if pos + 1 < chunk.len() {
                chunk[pos + 1].0
            } else {
                NOBLOCK
            };
            let mut block = Block::new_free(next, prev_writes);
            accessor.store_block(idx, &mut block)?;
        }
        let first = chunk[0].0;
        let last = chunk[chunk.len() - 1].0;
        if self.count == 0 {
            self.head = first;
        } else {
            let mut tail_block = accessor.load_block(self.tail)?;
            tail_block.header.next_block = first;
            accessor.store_block(self.tail, &mut tail_block)?;
        }
        self.tail = last;
        self.count += chunk.len() as u32;
        debug!("free list grew by {} block(s), count now {}", chunk.len(), self.count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemoryDevice;

    fn formatted_accessor(n: u32, b: u32) -> (BlockAccessor<MemoryDevice>, FreeBlockList) {
        let mut acc = BlockAccessor::new(MemoryDevice::new((n * b) as usize));
        acc.configure_block_size(b).unwrap();
        let mut info = Block::new_info(b as u16, n as u16, 0);
        acc.store_block(0, &mut info).unwrap();
        for i in 1..n as u16 {
            let next = if i == n as u16 - 1 { NOBLOCK } else { i + 1 };
            let mut block = Block::new_free(next, 0);
            acc.store_block(i, &mut block).unwrap();
        }
        (acc, FreeBlockList::new(n - 1, 1, (n - 1) as u16))
    }

    #[test]
    fn alloc_one_then_free_one_round_trips_count() {
        let (mut acc, mut list) = formatted_accessor(5, 32);
        let (idx, prev_writes) = list.alloc_one(&mut acc).unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(list.count(), 3);
        list.free_one(&mut acc, idx, prev_writes).unwrap();
        assert_eq!(list.count(), 4);
        assert_eq!(list.tail(), idx);
    }

    #[test]
    fn alloc_n_fails_cleanly_when_insufficient() {
        let (mut acc, mut list) = formatted_accessor(3, 32);
        assert!(list.alloc_n(&mut acc, 10).unwrap().is_none());
        assert_eq!(list.count(), 2);
    }

    #[test]
    fn backup_restore_undoes_allocation() {
        let (mut acc, mut list) = formatted_accessor(5, 32);
        let snap = list.backup();
        list.alloc_n(&mut acc, 2).unwrap();
        assert_eq!(list.count(), 2);
        list.restore(snap);
        assert_eq!(list.count(), 4);
    }
}
