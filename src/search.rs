//! SectionHeadIndex (`spec.md` §4.3): linear scan primitives over the block array.

use block_device::BlockDevice;

use crate::block::{BlockAccessor, BlockBody, BlockType};
use crate::error::EssResult;

/// Reads only `{type, hash}` with no CRC check — a fast prefilter.
pub fn find_section_head_by_hash<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    start: u16,
    hash: u8,
) -> EssResult<Option<u16>> {
    for idx in start..accessor.n_blocks() {
        if let Some((BlockType::Head, h)) = accessor.peek_type_and_hash(idx)? {
            if h == hash {
                return Ok(Some(idx));
            }
        }
    }
    Ok(None)
}

/// Loads candidate blocks fully and returns the first Head whose stored name
/// matches. Propagates media-integrity errors encountered along the way, carrying
/// the offending block index.
pub fn find_section_head<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    start: u16,
    name: &str,
    hash: u8,
) -> EssResult<Option<u16>> {
    for idx in start..accessor.n_blocks() {
        match accessor.peek_type_and_hash(idx)? {
            Some((BlockType::Head, h)) if h == hash => {
                let block = accessor.load_block(idx)?;
                if let BlockBody::Head { name: stored, .. } = &block.body {
                    if stored == name {
                        return Ok(Some(idx));
                    }
                }
            }
            _ => continue,
        }
    }
    Ok(None)
}

pub fn find_any_section_head<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    start: u16,
) -> EssResult<Option<u16>> {
    for idx in start..accessor.n_blocks() {
        if let Some((BlockType::Head, _)) = accessor.peek_type_and_hash(idx)? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

pub fn find_section_head_by_next_block<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    start: u16,
    next_block: u16,
) -> EssResult<Option<u16>> {
    for idx in start..accessor.n_blocks() {
        if let Some((BlockType::Head, _)) = accessor.peek_type_and_hash(idx)? {
            let block = accessor.load_block(idx)?;
            if block.header.next_block == next_block {
                return Ok(Some(idx));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{hash_name, Block, NOBLOCK};
    use block_device::MemoryDevice;

    fn accessor(n: u32, b: u32) -> BlockAccessor<MemoryDevice> {
        let mut acc = BlockAccessor::new(MemoryDevice::new((n * b) as usize));
        acc.configure_block_size(b).unwrap();
        acc
    }

    #[test]
    fn finds_head_by_name_among_other_blocks() {
        let mut acc = accessor(5, 64);
        let mut free = Block::new_free(NOBLOCK, 0);
        acc.store_block(1, &mut free).unwrap();
        let mut head = Block::new_head("alpha", 1, 3, 0);
        acc.store_block(2, &mut head).unwrap();

        let found = find_section_head(&mut acc, 1, "alpha", hash_name("alpha"))
            .unwrap()
            .unwrap();
        assert_eq!(found, 2);
        assert!(find_section_head(&mut acc, 1, "missing", hash_name("missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn finds_head_by_next_block() {
        let mut acc = accessor(5, 64);
        let mut head = Block::new_head("alpha", 1, 4, 0);
        acc.store_block(2, &mut head).unwrap();
        let found = find_section_head_by_next_block(&mut acc, 1, 4).unwrap().unwrap();
        assert_eq!(found, 2);
    }
}
