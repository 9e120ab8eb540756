//! Mounter (`spec.md` §4.4): Format, MountStep1 (fast, read-only) and MountStep2
//! (full scan, conflict resolution, garbage reclamation).

use std::cmp::Ordering;

use block_device::BlockDevice;
use log::{info, warn};

use crate::block::{
    Block, BlockAccessor, BlockBody, BlockType, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NOBLOCK,
    SECTION_SYSTEM_VERSION,
};
use crate::error::{EssError, EssResult};
use crate::free_list::FreeBlockList;

/// Wipes the media: a fresh Info block at 0, Free blocks 1..N-1 chained head-to-tail.
pub fn format<D: BlockDevice>(device: D, block_size: u32) -> EssResult<(BlockAccessor<D>, FreeBlockList)> {
    let mut accessor = BlockAccessor::new(device);
    accessor.configure_block_size(block_size)?;
    let n = accessor.n_blocks();

    let mut info = Block::new_info(block_size as u16, n, 0);
    accessor.store_block(0, &mut info)?;

    for i in 1..n {
        let next = if i == n - 1 { NOBLOCK } else { i + 1 };
        let mut free = Block::new_free(next, 0);
        accessor.store_block(i, &mut free)?;
    }

    info!("formatted {n} blocks of {block_size} bytes each");
    Ok((accessor, FreeBlockList::new((n - 1) as u32, 1, n - 1)))
}

fn smallest_trial_block_size(page_size: u32) -> Option<u32> {
    let mut b = MIN_BLOCK_SIZE;
    while b <= MAX_BLOCK_SIZE {
        if page_size == 0 || (b <= page_size && page_size % b == 0) {
            return Some(b);
        }
        b *= 2;
    }
    None
}

/// Fast, read-only mount: configures a trial block size, reads only the info block,
/// then reconfigures to the real geometry it declares.
pub fn mount_step1<D: BlockDevice>(device: D) -> EssResult<BlockAccessor<D>> {
    let mut accessor = BlockAccessor::new(device);
    let page_size = accessor.device().page_size();
    let trial = smallest_trial_block_size(page_size).ok_or_else(|| EssError::StorageSizeMismatch {
        reason: "no block size in range satisfies the device's page constraints".into(),
    })?;
    accessor
        .configure_block_size(trial)
        .map_err(|_| EssError::BadInfoBlock { idx: 0 })?;

    let info_block = accessor.load_block(0).map_err(|_| EssError::BadInfoBlock { idx: 0 })?;
    let (version, block_size, declared_n_blocks) = match info_block.body {
        BlockBody::Info {
            section_system_version,
            block_size,
            n_blocks,
        } => (section_system_version, block_size, n_blocks),
        _ => return Err(EssError::BadInfoBlock { idx: 0 }),
    };

    if version != SECTION_SYSTEM_VERSION {
        return Err(EssError::InvalidVersion {
            found: version,
            expected: SECTION_SYSTEM_VERSION,
        });
    }

    accessor
        .configure_block_size(block_size as u32)
        .map_err(|e| EssError::StorageSizeMismatch { reason: e.to_string() })?;
    if accessor.n_blocks() != declared_n_blocks {
        return Err(EssError::StorageSizeMismatch {
            reason: format!(
                "info block declares {declared_n_blocks} blocks, geometry computes {}",
                accessor.n_blocks()
            ),
        });
    }

    Ok(accessor)
}

fn version_cmp(a: u16, b: u16) -> Ordering {
    let diff = a.wrapping_sub(b) as i16;
    diff.cmp(&0)
}

struct HeadCandidate {
    idx: u16,
    name: String,
    version: u16,
    next_block: u16,
}

/// Full check-and-repair mount. Classifies every block as used or garbage,
/// resolves conflicting section Heads by version, and reclaims garbage onto the
/// free list.
pub fn mount_step2<D: BlockDevice>(accessor: &mut BlockAccessor<D>) -> EssResult<FreeBlockList> {
    let n = accessor.n_blocks();
    let mut used = vec![false; n as usize];
    let mut garbage = vec![false; n as usize];
    used[0] = true;

    let mut adopted: Option<(u16, u16, u32)> = None; // (head, tail, count)
    let mut heads: Vec<HeadCandidate> = Vec::new();

    for i in 1..n {
        match accessor.peek_type_and_hash(i)? {
            None => {
                garbage[i as usize] = true;
            }
            Some((BlockType::Info, _)) => {
                warn!("info block encountered at non-zero index {i}");
                garbage[i as usize] = true;
            }
            Some((BlockType::Data, _)) => {
                // Claimed later by its Head, or reclaimed in step 5.
            }
            Some((BlockType::Free, _)) => {
                walk_free_chain(accessor, i, &mut used, &mut garbage, &mut adopted)?;
            }
            Some((BlockType::Head, _)) => match accessor.load_block(i) {
                Err(_) => {
                    garbage[i as usize] = true;
                }
                Ok(block) => {
                    if let BlockBody::Head { version, name } = block.body {
                        resolve_head_candidate(
                            &mut heads,
                            &mut garbage,
                            HeadCandidate {
                                idx: i,
                                name,
                                version,
                                next_block: block.header.next_block,
                            },
                        )?;
                    }
                }
            },
        }
    }

    for head in &heads {
        walk_section_chain(accessor, head, &mut used, &mut garbage);
    }

    // Step 4: ensure the free-tail's nextBlock is NOBLOCK on media.
    if let Some((_, tail, _)) = adopted {
        if accessor.load_field_next_block(tail)? != NOBLOCK {
            let mut tail_block = accessor.load_block(tail)?;
            tail_block.header.next_block = NOBLOCK;
            accessor.store_block(tail, &mut tail_block)?;
        }
    }

    let mut free_list = match adopted {
        Some((head, tail, count)) => FreeBlockList::new(count, head, tail),
        None => FreeBlockList::empty(),
    };

    // Step 5: reclaim every still-unclaimed block.
    let mut reclaim = Vec::new();
    for i in 1..n {
        if !used[i as usize] {
            let prev_writes = accessor.load_field_total_nb_of_writes(i).unwrap_or(0);
            reclaim.push((i, prev_writes));
        }
    }
    let chunk_size = (accessor.block_size() as usize / 2).max(1);
    free_list.free_many(accessor, &reclaim, chunk_size)?;

    info!(
        "mount_step2 complete: {} used, {} reclaimed, free list count {}",
        used.iter().filter(|&&u| u).count(),
        reclaim.len(),
        free_list.count()
    );
    Ok(free_list)
}

fn resolve_head_candidate(
    heads: &mut Vec<HeadCandidate>,
    garbage: &mut [bool],
    candidate: HeadCandidate,
) -> EssResult<()> {
    if let Some(pos) = heads.iter().position(|h| h.next_block == candidate.next_block) {
        return settle_conflict(heads, garbage, pos, candidate, "nextBlock");
    }
    if let Some(pos) = heads.iter().position(|h| h.name == candidate.name) {
        return settle_conflict(heads, garbage, pos, candidate, "name");
    }
    heads.push(candidate);
    Ok(())
}

fn settle_conflict(
    heads: &mut Vec<HeadCandidate>,
    garbage: &mut [bool],
    pos: usize,
    candidate: HeadCandidate,
    axis: &str,
) -> EssResult<()> {
    match version_cmp(candidate.version, heads[pos].version) {
        Ordering::Equal => Err(EssError::BlockLinkage {
            reason: format!("two head blocks conflict on {axis} with equal version"),
            idx: candidate.idx,
        }),
        Ordering::Greater => {
            garbage[heads[pos].idx as usize] = true;
            heads[pos] = candidate;
            Ok(())
        }
        Ordering::Less => {
            garbage[candidate.idx as usize] = true;
            Ok(())
        }
    }
}

fn walk_free_chain<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    start: u16,
    used: &mut [bool],
    garbage: &mut [bool],
    adopted: &mut Option<(u16, u16, u32)>,
) -> EssResult<()> {
    let mut chain = Vec::new();
    let mut cur = start;
    loop {
        if used[cur as usize] || garbage[cur as usize] {
            for &c in &chain {
                garbage[c as usize] = true;
            }
            return Ok(());
        }
        let block = match accessor.load_block(cur) {
            Ok(b) => b,
            Err(_) => {
                for &c in &chain {
                    garbage[c as usize] = true;
                }
                garbage[cur as usize] = true;
                return Ok(());
            }
        };
        if !matches!(block.body, BlockBody::Free) {
            for &c in &chain {
                garbage[c as usize] = true;
            }
            return Ok(());
        }
        chain.push(cur);
        let next = block.header.next_block;

        if let Some((adopted_head, adopted_tail, adopted_count)) = *adopted {
            if next == adopted_head {
                for &c in &chain {
                    used[c as usize] = true;
                }
                *adopted = Some((chain[0], adopted_tail, adopted_count + chain.len() as u32));
                return Ok(());
            }
        }
        if next == NOBLOCK {
            if adopted.is_none() {
                for &c in &chain {
                    used[c as usize] = true;
                }
                *adopted = Some((chain[0], *chain.last().unwrap(), chain.len() as u32));
            } else {
                // A second, disjoint free chain: the on-media list must be singular.
                for &c in &chain {
                    garbage[c as usize] = true;
                }
            }
            return Ok(());
        }
        cur = next;
    }
}

fn walk_section_chain<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    head: &HeadCandidate,
    used: &mut [bool],
    garbage: &mut [bool],
) {
    let mut visited = vec![head.idx];
    let mut cur = head.next_block;
    let mut expected_seq = 1u16;
    let mut ok;
    loop {
        match accessor.load_block(cur) {
            Ok(block) => match block.body {
                BlockBody::Data { seq_nb, .. } if seq_nb == expected_seq => {
                    visited.push(cur);
                    let next = block.header.next_block;
                    if next == NOBLOCK {
                        ok = true;
                        break;
                    }
                    expected_seq = expected_seq.wrapping_add(1);
                    cur = next;
                }
                _ => {
                    visited.push(cur);
                    ok = false;
                    break;
                }
            },
            Err(_) => {
                visited.push(cur);
                ok = false;
                break;
            }
        }
    }
    for v in visited {
        if ok {
            used[v as usize] = true;
        } else {
            garbage[v as usize] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::hash_name;
    use block_device::MemoryDevice;

    #[test]
    fn format_then_mount_round_trips_geometry() {
        let device = MemoryDevice::new(5 * 32);
        let (accessor, free_list) = format(device, 32).unwrap();
        assert_eq!(accessor.n_blocks(), 5);
        assert_eq!(free_list.count(), 4);

        let device = accessor.into_device();
        let mut accessor = mount_step1(device).unwrap();
        assert_eq!(accessor.n_blocks(), 5);
        let free_list = mount_step2(&mut accessor).unwrap();
        assert_eq!(free_list.count(), 4);
    }

    #[test]
    fn mount_step2_reclaims_orphaned_data_block() {
        let device = MemoryDevice::new(6 * 32);
        let (mut accessor, _) = format(device, 32).unwrap();
        // Plant an orphan Data block with no referring Head at a free slot.
        let mut orphan = Block::new_data(1, vec![9, 9], NOBLOCK, 0);
        accessor.store_block(2, &mut orphan).unwrap();

        let free_list = mount_step2(&mut accessor).unwrap();
        // 5 free blocks originally (1..5); the orphan is reclaimed, restoring all 5.
        assert_eq!(free_list.count(), 5);
    }

    #[test]
    fn mount_step2_resolves_duplicate_heads_by_version() {
        let device = MemoryDevice::new(6 * 32);
        let (mut accessor, _) = format(device, 32).unwrap();

        // Two Heads sharing the same nextBlock, the newer one should win.
        let mut data = Block::new_data(1, vec![1], NOBLOCK, 0);
        accessor.store_block(2, &mut data).unwrap();
        let mut old_head = Block::new_head("a", 1, 2, 0);
        accessor.store_block(3, &mut old_head).unwrap();
        let mut new_head = Block::new_head("a", 2, 2, 0);
        accessor.store_block(4, &mut new_head).unwrap();

        let free_list = mount_step2(&mut accessor).unwrap();
        // Blocks 1 and 3 (the broken free-chain head and the stale section head)
        // are reclaimed alongside the one genuinely free block (5).
        assert_eq!(free_list.count(), 3);
        let found = crate::search::find_section_head(&mut accessor, 1, "a", hash_name("a"))
            .unwrap()
            .unwrap();
        assert_eq!(found, 4);
    }

    #[test]
    fn mount_step2_selects_wrapped_version_zero_over_0xffff() {
        let device = MemoryDevice::new(6 * 32);
        let (mut accessor, _) = format(device, 32).unwrap();

        let mut data = Block::new_data(1, vec![1], NOBLOCK, 0);
        accessor.store_block(2, &mut data).unwrap();
        let mut stale_head = Block::new_head("a", 0xFFFF, 2, 0);
        accessor.store_block(3, &mut stale_head).unwrap();
        let mut wrapped_head = Block::new_head("a", 0x0000, 2, 0);
        accessor.store_block(4, &mut wrapped_head).unwrap();

        mount_step2(&mut accessor).unwrap();
        let found = crate::search::find_section_head(&mut accessor, 1, "a", hash_name("a"))
            .unwrap()
            .unwrap();
        assert_eq!(found, 4);
    }
}
