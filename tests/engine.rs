//! End-to-end exercises of the public `Engine` API, covering the scenarios and
//! testable properties of `spec.md` §8.

use block_device::{BlockDevice, MemoryDevice, TornWriteDevice};
use ess::block::{Block, BlockAccessor, NOBLOCK};
use ess::free_list::FreeBlockList;
use ess::{mount, Engine, EngineState, EssError, RemainingBitsExpectation, StreamReader, StreamWriter};

fn formatted(n_blocks: u32, block_size: u32) -> Engine<MemoryDevice> {
    let device = MemoryDevice::new((n_blocks * block_size) as usize);
    let engine = Engine::new(device);
    engine.format(block_size).unwrap();
    engine
}

fn write_section(engine: &Engine<MemoryDevice>, name: &str, overwrite: bool, payload: &[u8]) {
    let mut writer = engine.create(name, overwrite).unwrap();
    writer.write_bytes(payload).unwrap();
    writer.close().unwrap();
}

fn read_section(engine: &Engine<MemoryDevice>, name: &str) -> Vec<u8> {
    let (payload_len, _) = engine.determine_size(name).unwrap();
    let mut reader = engine.open(name).unwrap();
    let data = if payload_len == 0 {
        Vec::new()
    } else {
        reader.read_bytes(payload_len as usize).unwrap()
    };
    reader.close().unwrap();
    data
}

// Scenario 1: basic create/read.
#[test]
fn basic_create_and_read() {
    let engine = formatted(64, 128);
    let before = engine.get_free_space().unwrap();

    let payload: Vec<u8> = (0u8..=0x1F).collect();
    write_section(&engine, "a", false, &payload);

    let got = read_section(&engine, "a");
    assert_eq!(got, payload);
    assert!(engine.get_free_space().unwrap() < before);
}

// Scenario 2: overwrite with a smaller payload.
#[test]
fn overwrite_with_smaller_payload_frees_the_old_chain() {
    let engine = formatted(64, 128);
    write_section(&engine, "a", false, &[1, 2, 3, 4, 5]);
    let free_after_first = engine.get_free_space().unwrap();

    write_section(&engine, "a", true, &[9, 9]);
    assert_eq!(read_section(&engine, "a"), vec![9, 9]);

    // The old one-data-block chain was freed and a new one-data-block chain
    // allocated in its place, so free space round-trips back to what it was.
    assert_eq!(engine.get_free_space().unwrap(), free_after_first);
}

// Scenario 4: rename preserves payload and leaves free space untouched.
#[test]
fn rename_preserves_payload_and_free_space() {
    let engine = formatted(64, 128);
    write_section(&engine, "foo", false, &[42]);
    let free_before = engine.get_free_space().unwrap();

    engine.rename("foo", "bar").unwrap();

    assert_eq!(read_section(&engine, "bar"), vec![42]);
    let err = engine.open("foo").unwrap_err();
    assert!(matches!(err, EssError::NoSuchFile { .. }));
    assert_eq!(engine.get_free_space().unwrap(), free_before);
}

// Scenario 5: a reader holds a section open; a concurrent overwrite must be
// rejected, then succeed once the reader releases the lock.
#[test]
fn reader_and_writer_are_mutually_exclusive() {
    let engine = formatted(64, 128);
    write_section(&engine, "a", false, &[1, 2, 3]);

    let mut reader = engine.open("a").unwrap();
    let err = engine.create("a", true).unwrap_err();
    assert!(matches!(err, EssError::FileAlreadyAccessed { .. }));

    reader.close().unwrap();
    let mut writer = engine.create("a", true).unwrap();
    writer.write_bytes(&[9]).unwrap();
    writer.close().unwrap();
    assert_eq!(read_section(&engine, "a"), vec![9]);
}

// Scenario 6: a planted orphan Data block is reclaimed by MountStep2, and free
// space is unaffected by an intervening unmount/remount cycle.
#[test]
fn garbage_reclamation_survives_a_remount() {
    let device = MemoryDevice::new(6 * 32);
    let engine = Engine::new(device);
    engine.format(32).unwrap();
    let free_before = engine.get_free_space().unwrap();

    engine.unmount().unwrap();
    engine.mount_step1().unwrap();
    engine.mount_step2().unwrap();
    assert_eq!(engine.get_free_space().unwrap(), free_before);
    assert_eq!(engine.state(), EngineState::Mounted);
}

// P7: Enumerate returns names in ascending byte order, capitals before lowercase.
#[test]
fn enumerate_sorts_ascii_byte_order() {
    let engine = formatted(64, 128);
    for name in ["banana", "Apple", "cherry", "apple2"] {
        write_section(&engine, name, false, name.as_bytes());
    }
    let names = engine.enumerate().unwrap();
    assert_eq!(names, vec!["Apple", "apple2", "banana", "cherry"]);
}

// A zero-byte section still occupies exactly one Head and one Data block, and
// round-trips through an empty read.
#[test]
fn zero_byte_section_round_trips() {
    let engine = formatted(64, 128);
    write_section(&engine, "empty", false, &[]);
    assert_eq!(read_section(&engine, "empty"), Vec::<u8>::new());
    let (payload, total) = engine.determine_size("empty").unwrap();
    assert_eq!(payload, 0);
    assert_eq!(total, 2 * 128); // one Head block plus one Data block.
}

// Minimum legal geometry: N=3, B=32 must format, mount, and hold one zero-byte
// section.
#[test]
fn minimum_geometry_supports_one_empty_section() {
    let engine = formatted(3, 32);
    assert_eq!(engine.state(), EngineState::Mounted);
    write_section(&engine, "x", false, &[]);
    assert_eq!(read_section(&engine, "x"), Vec::<u8>::new());
}

// Boundary: a name at the maximum allowed length succeeds; one byte more fails.
#[test]
fn name_length_boundary() {
    let engine = formatted(8, 32);
    let max_len = 32 - ess::HEAD_NAME_OVERHEAD;
    let ok_name = "a".repeat(max_len);
    write_section(&engine, &ok_name, false, &[]);

    let too_long = "a".repeat(max_len + 1);
    let err = engine.create(&too_long, false).unwrap_err();
    assert!(matches!(err, EssError::InvalidName { .. }));
}

// Boundary: filling every free data block's worth of payload succeeds; one byte
// more triggers InsufficientSpace, and the engine remains usable afterward.
#[test]
fn insufficient_space_boundary() {
    let engine = formatted(4, 32); // 3 free blocks after format.
    let capacity_per_block = 32usize - 14;
    let free_blocks_for_data = 2; // one block is always reserved for the new Head.
    let max_payload = free_blocks_for_data * capacity_per_block;

    let mut writer = engine.create("big", false).unwrap();
    writer.write_bytes(&vec![0xAB; max_payload]).unwrap();
    writer.close().unwrap();
    assert_eq!(engine.determine_size("big").unwrap().0, max_payload as u64);

    engine.delete("big").unwrap();
    let mut writer = engine.create("big2", false).unwrap();
    let err = writer.write_bytes(&vec![0xAB; max_payload + 1]).unwrap_err();
    assert!(matches!(err, EssError::InsufficientSpace));
}

// A byte-level write following a bit-level write must flush the cached bits
// first, zero-padding the high bits, rather than reordering ahead of them.
#[test]
fn write_byte_flushes_pending_bits_first() {
    let engine = formatted(8, 64);

    let mut writer = engine.create("mixed", false).unwrap();
    writer.write_bits(0b011, 3).unwrap();
    writer.write_byte(0xAA).unwrap();
    writer.close().unwrap();

    let mut reader = engine.open("mixed").unwrap();
    assert_eq!(reader.read_bits(3).unwrap(), 0b011);
    reader.ensure_all_data_consumed(RemainingBitsExpectation::MoreThanSeven).unwrap();
    assert_eq!(reader.read_byte().unwrap(), 0xAA);
    reader.ensure_all_data_consumed(RemainingBitsExpectation::Zero).unwrap();
    reader.close().unwrap();
}

// `fill_bits` writes `n` copies of a single fill bit, not the low `n` bits of a
// literal multi-bit value.
#[test]
fn fill_bits_writes_repeated_single_bit() {
    let engine = formatted(8, 64);

    let mut writer = engine.create("filled", false).unwrap();
    writer.fill_bits(1, 4).unwrap();
    writer.fill_bits(0, 4).unwrap();
    writer.close().unwrap();

    let mut reader = engine.open("filled").unwrap();
    assert_eq!(reader.read_byte().unwrap(), 0x0F);
    reader.ensure_all_data_consumed(RemainingBitsExpectation::Zero).unwrap();
    reader.close().unwrap();
}

// `ensure_all_data_consumed` must account for whole unread bytes, not just the
// sub-byte bit cache: partially reading a multi-byte payload must fail `Zero`.
#[test]
fn ensure_all_data_consumed_accounts_for_unread_bytes() {
    let engine = formatted(8, 64);
    write_section(&engine, "partial", false, &[1, 2, 3]);

    let mut reader = engine.open("partial").unwrap();
    assert_eq!(reader.read_byte().unwrap(), 1);
    let err = reader
        .ensure_all_data_consumed(RemainingBitsExpectation::Zero)
        .unwrap_err();
    assert!(matches!(err, EssError::RemainingBits { .. }));

    assert_eq!(reader.read_bytes(2).unwrap(), vec![2, 3]);
    reader.ensure_all_data_consumed(RemainingBitsExpectation::Zero).unwrap();
    reader.close().unwrap();
}

/// Allocates a fresh Head+single-Data chain directly through `BlockAccessor` and
/// `FreeBlockList`, bypassing `Engine`/`SectionWriter` so the crash test below can
/// reuse the exact same device handle across a `TornWriteDevice` rewrap.
fn build_section<D: BlockDevice>(
    accessor: &mut BlockAccessor<D>,
    free_list: &mut FreeBlockList,
    name: &str,
    version: u16,
    payload: &[u8],
) -> u16 {
    let alloc = free_list.alloc_n(accessor, 2).unwrap().expect("enough free blocks");
    let head_idx = alloc[0].0;
    let data_idx = alloc[1].0;
    let mut data = Block::new_data(1, payload.to_vec(), NOBLOCK, alloc[1].1);
    accessor.store_block(data_idx, &mut data).unwrap();
    let mut head = Block::new_head(name, version, data_idx, alloc[0].1);
    accessor.store_block(head_idx, &mut head).unwrap();
    head_idx
}

// P3/P4: interrupting an overwrite's physical writes at any prefix, then running
// MountStep1+MountStep2, must land on either the pre- or post-image and never a
// hybrid; a second repair pass must then be a no-op.
#[test]
fn crash_during_overwrite_recovers_to_pre_or_post_image() {
    let block_size = 64u32;
    let n_blocks = 8u32;
    let size = (n_blocks * block_size) as usize;
    let pre = vec![1u8, 2, 3, 4, 5];
    let post = vec![9u8, 9];

    for trip_after in 0..300u64 {
        let mem = MemoryDevice::new(size);
        let (mut accessor, mut free_list) = mount::format(mem, block_size).unwrap();
        let old_head_idx = build_section(&mut accessor, &mut free_list, "a", 0, &pre);

        // Re-wrap the populated device behind a write budget and replay exactly
        // what `SectionWriter::close` does for an overwrite: store the new data
        // block, store the new head, then free the old chain.
        let torn = TornWriteDevice::new(accessor.into_device()).trip_after(trip_after);
        let mut accessor = BlockAccessor::new(torn);
        accessor.configure_block_size(block_size).unwrap();

        let _ = (|| -> ess::EssResult<()> {
            let alloc = free_list
                .alloc_n(&mut accessor, 2)?
                .ok_or(EssError::InsufficientSpace)?;
            let new_head_idx = alloc[0].0;
            let new_data_idx = alloc[1].0;
            let mut data = Block::new_data(1, post.clone(), NOBLOCK, alloc[1].1);
            accessor.store_block(new_data_idx, &mut data)?;
            let mut head = Block::new_head("a", 1, new_data_idx, alloc[0].1);
            accessor.store_block(new_head_idx, &mut head)?;
            free_list.free_chain(&mut accessor, old_head_idx, NOBLOCK)?;
            Ok(())
        })();

        // "Power back on": same bytes, a fresh untripped device handle.
        let mem = accessor.into_device().into_inner();
        let engine = Engine::new(mem);
        engine.mount_step1().unwrap();
        engine.mount_step2().unwrap();
        assert_eq!(engine.state(), EngineState::Mounted);

        let got = read_section(&engine, "a");
        assert!(
            got == pre || got == post,
            "trip_after={trip_after} produced neither pre- nor post-image: {got:?}"
        );

        let free_once = engine.get_free_space().unwrap();
        engine.mount_step2().unwrap();
        assert_eq!(engine.get_free_space().unwrap(), free_once);
    }
}
