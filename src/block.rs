//! BlockAccessor (`spec.md` §4.1): a typed, validated, endian-normalized view of the
//! raw storage as an array of fixed-size blocks.

use std::convert::TryFrom;

use block_device::BlockDevice;
use log::{trace, warn};
use num_enum::TryFromPrimitive;

use crate::error::{EssError, EssResult};

pub const NOBLOCK: u16 = 0xFFFF;
pub const SECTION_SYSTEM_VERSION: u16 = 0x0002;
pub const MIN_BLOCK_SIZE: u32 = 32;
pub const MAX_BLOCK_SIZE: u32 = 4096;
pub const MIN_BLOCKS: u32 = 3;
pub const MAX_BLOCKS: u32 = 65535;

const HEADER_LEN: usize = 10;
const CRC_LEN: usize = 2;
const INFO_BODY_LEN: usize = 6;
const FREE_BODY_LEN: usize = 0;
const HEAD_BODY_FIXED_LEN: usize = 3; // version(2) + nul(1)
const DATA_BODY_FIXED_LEN: usize = 2; // seqNb(2)

/// Non-name overhead of a Head block (header + version + nul + CRC); a name's
/// length is bounded by `block_size - HEAD_NAME_OVERHEAD` (§3.4).
pub const HEAD_NAME_OVERHEAD: usize = HEADER_LEN + HEAD_BODY_FIXED_LEN + CRC_LEN;

pub fn info_n_bytes() -> u16 {
    (HEADER_LEN + INFO_BODY_LEN + CRC_LEN) as u16
}

pub fn free_n_bytes() -> u16 {
    (HEADER_LEN + FREE_BODY_LEN + CRC_LEN) as u16
}

pub fn head_n_bytes(name_len: usize) -> u16 {
    (HEADER_LEN + HEAD_BODY_FIXED_LEN + name_len + CRC_LEN) as u16
}

pub fn data_n_bytes(payload_len: usize) -> u16 {
    (HEADER_LEN + DATA_BODY_FIXED_LEN + payload_len + CRC_LEN) as u16
}

/// Additive 8-bit hash used as a fast prefilter (§6.4).
pub fn hash_name(name: &str) -> u8 {
    name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();

/// CRC-16/CCITT-FALSE: init 0xFFFF, poly 0x1021, no reflection, xorout 0x0000.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        let idx = (((crc >> 8) ^ b as u16) & 0xFF) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockType {
    Info = 0,
    Free = 1,
    Head = 2,
    Data = 3,
}

#[derive(Debug, Clone)]
pub struct CommonHeader {
    pub block_type: BlockType,
    pub section_name_hash: u8,
    pub n_bytes: u16,
    pub total_nb_of_writes: u32,
    pub next_block: u16,
}

#[derive(Debug, Clone)]
pub enum BlockBody {
    Info {
        section_system_version: u16,
        block_size: u16,
        n_blocks: u16,
    },
    Free,
    Head {
        version: u16,
        name: String,
    },
    Data {
        seq_nb: u16,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Block {
    pub header: CommonHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new_info(block_size: u16, n_blocks: u16, total_nb_of_writes: u32) -> Self {
        Block {
            header: CommonHeader {
                block_type: BlockType::Info,
                section_name_hash: 0,
                n_bytes: info_n_bytes(),
                total_nb_of_writes,
                next_block: NOBLOCK,
            },
            body: BlockBody::Info {
                section_system_version: SECTION_SYSTEM_VERSION,
                block_size,
                n_blocks,
            },
        }
    }

    pub fn new_free(next_block: u16, total_nb_of_writes: u32) -> Self {
        Block {
            header: CommonHeader {
                block_type: BlockType::Free,
                section_name_hash: 0,
                n_bytes: free_n_bytes(),
                total_nb_of_writes,
                next_block,
            },
            body: BlockBody::Free,
        }
    }

    pub fn new_head(
        name: &str,
        version: u16,
        next_block: u16,
        total_nb_of_writes: u32,
    ) -> Self {
        Block {
            header: CommonHeader {
                block_type: BlockType::Head,
                section_name_hash: hash_name(name),
                n_bytes: head_n_bytes(name.len()),
                total_nb_of_writes,
                next_block,
            },
            body: BlockBody::Head {
                version,
                name: name.to_string(),
            },
        }
    }

    pub fn new_data(
        seq_nb: u16,
        payload: Vec<u8>,
        next_block: u16,
        total_nb_of_writes: u32,
    ) -> Self {
        Block {
            header: CommonHeader {
                block_type: BlockType::Data,
                section_name_hash: 0,
                n_bytes: data_n_bytes(payload.len()),
                total_nb_of_writes,
                next_block,
            },
            body: BlockBody::Data { seq_nb, payload },
        }
    }
}

/// Partitions the raw storage into `N` fixed-size blocks.
pub struct BlockAccessor<D> {
    device: D,
    block_size: u32,
    n_blocks: u16,
}

impl<D: BlockDevice> BlockAccessor<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            block_size: 0,
            n_blocks: 0,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn n_blocks(&self) -> u16 {
        self.n_blocks
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Recomputes `N` for a given block size `B`, rejecting values outside the
    /// geometry the device and the format can support (§3.1).
    pub fn configure_block_size(&mut self, block_size: u32) -> EssResult<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(EssError::ConfigError {
                reason: format!(
                    "block size {block_size} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"
                ),
            });
        }
        let page_size = self.device.page_size();
        if page_size != 0 {
            if block_size > page_size {
                return Err(EssError::ConfigError {
                    reason: format!("block size {block_size} exceeds device page size {page_size}"),
                });
            }
            if page_size % block_size != 0 {
                return Err(EssError::ConfigError {
                    reason: format!(
                        "block size {block_size} does not divide device page size {page_size}"
                    ),
                });
            }
        }
        let total = self.device.size();
        let n_blocks = total / block_size as u64;
        if !(MIN_BLOCKS as u64..=MAX_BLOCKS as u64).contains(&n_blocks) {
            return Err(EssError::ConfigError {
                reason: format!(
                    "device of {total} bytes at block size {block_size} yields {n_blocks} blocks, outside [{MIN_BLOCKS}, {MAX_BLOCKS}]"
                ),
            });
        }
        self.block_size = block_size;
        self.n_blocks = n_blocks as u16;
        Ok(())
    }

    fn check_idx(&self, idx: u16) -> EssResult<()> {
        if idx >= self.n_blocks {
            return Err(EssError::ConfigError {
                reason: format!("block index {idx} out of range [0, {})", self.n_blocks),
            });
        }
        Ok(())
    }

    fn check_next_block(&self, idx: u16, next_block: u16) -> EssResult<()> {
        if next_block == NOBLOCK {
            return Ok(());
        }
        if next_block == 0 || next_block >= self.n_blocks || next_block == idx {
            return Err(EssError::InvalidHeader {
                reason: format!("nextBlock {next_block} is not a valid successor for block {idx}"),
                idx,
            });
        }
        Ok(())
    }

    fn addr_of(&self, idx: u16) -> u64 {
        idx as u64 * self.block_size as u64
    }

    /// Reads `type` and `sectionNameHash` without CRC validation (§4.3 fast prefilter).
    pub fn peek_type_and_hash(&mut self, idx: u16) -> EssResult<Option<(BlockType, u8)>> {
        self.check_idx(idx)?;
        let mut buf = [0u8; 2];
        self.device.read(self.addr_of(idx), &mut buf)?;
        Ok(BlockType::try_from(buf[0]).ok().map(|t| (t, buf[1])))
    }

    pub fn load_field_next_block(&mut self, idx: u16) -> EssResult<u16> {
        self.check_idx(idx)?;
        let mut buf = [0u8; 2];
        self.device.read(self.addr_of(idx) + 8, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn load_field_total_nb_of_writes(&mut self, idx: u16) -> EssResult<u32> {
        self.check_idx(idx)?;
        let mut buf = [0u8; 4];
        self.device.read(self.addr_of(idx) + 4, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads `nBytes`, validates the CRC, decodes the header and body, and enforces
    /// the per-type structural predicates (§4.1).
    pub fn load_block(&mut self, idx: u16) -> EssResult<Block> {
        self.check_idx(idx)?;
        let block_size = self.block_size as usize;
        let mut buf = vec![0u8; block_size];
        self.device.read(self.addr_of(idx), &mut buf)?;

        let block_type = BlockType::try_from(buf[0]).map_err(|_| EssError::InvalidHeader {
            reason: format!("unknown block type byte {}", buf[0]),
            idx,
        })?;
        let section_name_hash = buf[1];
        let n_bytes = u16::from_le_bytes([buf[2], buf[3]]);
        let total_nb_of_writes = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let next_block = u16::from_le_bytes([buf[8], buf[9]]);

        if (n_bytes as usize) < HEADER_LEN + CRC_LEN || n_bytes as usize > block_size {
            return Err(EssError::InvalidHeader {
                reason: format!("nBytes {n_bytes} out of bounds for block size {block_size}"),
                idx,
            });
        }
        let crc_pos = n_bytes as usize - CRC_LEN;
        let expected_crc = u16::from_le_bytes([buf[crc_pos], buf[crc_pos + 1]]);
        let actual_crc = crc16_ccitt_false(&buf[..crc_pos]);
        if expected_crc != actual_crc {
            return Err(EssError::CrcError { idx });
        }

        self.check_next_block(idx, next_block)?;

        let header = CommonHeader {
            block_type,
            section_name_hash,
            n_bytes,
            total_nb_of_writes,
            next_block,
        };
        let body = self.decode_body(idx, &header, &buf[HEADER_LEN..crc_pos])?;
        trace!("loaded block {idx} type {block_type:?} n_bytes {n_bytes}");
        Ok(Block { header, body })
    }

    fn decode_body(&self, idx: u16, header: &CommonHeader, body_bytes: &[u8]) -> EssResult<BlockBody> {
        match header.block_type {
            BlockType::Info => {
                if header.n_bytes != info_n_bytes() || header.section_name_hash != 0 {
                    return Err(EssError::InvalidHeader {
                        reason: "info block has unexpected shape".into(),
                        idx,
                    });
                }
                if header.next_block != NOBLOCK {
                    return Err(EssError::InvalidHeader {
                        reason: "info block must not chain".into(),
                        idx,
                    });
                }
                if body_bytes.len() != INFO_BODY_LEN {
                    return Err(EssError::InvalidHeader {
                        reason: "info body truncated".into(),
                        idx,
                    });
                }
                Ok(BlockBody::Info {
                    section_system_version: u16::from_le_bytes([body_bytes[0], body_bytes[1]]),
                    block_size: u16::from_le_bytes([body_bytes[2], body_bytes[3]]),
                    n_blocks: u16::from_le_bytes([body_bytes[4], body_bytes[5]]),
                })
            }
            BlockType::Free => {
                if header.n_bytes != free_n_bytes() || header.section_name_hash != 0 {
                    return Err(EssError::InvalidHeader {
                        reason: "free block has unexpected shape".into(),
                        idx,
                    });
                }
                Ok(BlockBody::Free)
            }
            BlockType::Head => {
                if (header.n_bytes as usize) < HEADER_LEN + HEAD_BODY_FIXED_LEN + 1 + CRC_LEN {
                    return Err(EssError::InvalidHeader {
                        reason: "head block too short".into(),
                        idx,
                    });
                }
                if header.next_block == NOBLOCK {
                    return Err(EssError::InvalidHeader {
                        reason: "head block must reference a data chain".into(),
                        idx,
                    });
                }
                if body_bytes.len() < HEAD_BODY_FIXED_LEN {
                    return Err(EssError::InvalidHeader {
                        reason: "head body truncated".into(),
                        idx,
                    });
                }
                let version = u16::from_le_bytes([body_bytes[0], body_bytes[1]]);
                let name_and_nul = &body_bytes[2..];
                if name_and_nul.last() != Some(&0) {
                    return Err(EssError::InvalidHeader {
                        reason: "head name is not NUL-terminated".into(),
                        idx,
                    });
                }
                let name_bytes = &name_and_nul[..name_and_nul.len() - 1];
                if name_bytes.contains(&0) {
                    return Err(EssError::InvalidHeader {
                        reason: "embedded NUL in head name".into(),
                        idx,
                    });
                }
                let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| EssError::InvalidHeader {
                    reason: "head name is not valid UTF-8".into(),
                    idx,
                })?;
                if hash_name(&name) != header.section_name_hash {
                    return Err(EssError::InvalidHeader {
                        reason: "head name hash mismatch".into(),
                        idx,
                    });
                }
                Ok(BlockBody::Head { version, name })
            }
            BlockType::Data => {
                if header.section_name_hash != 0 {
                    return Err(EssError::InvalidHeader {
                        reason: "data block must not carry a name hash".into(),
                        idx,
                    });
                }
                if body_bytes.len() < DATA_BODY_FIXED_LEN {
                    return Err(EssError::InvalidHeader {
                        reason: "data body truncated".into(),
                        idx,
                    });
                }
                let seq_nb = u16::from_le_bytes([body_bytes[0], body_bytes[1]]);
                if seq_nb as u32 > self.n_blocks as u32 - 2 {
                    return Err(EssError::InvalidHeader {
                        reason: format!("seqNb {seq_nb} exceeds N-2"),
                        idx,
                    });
                }
                Ok(BlockBody::Data {
                    seq_nb,
                    payload: body_bytes[DATA_BODY_FIXED_LEN..].to_vec(),
                })
            }
        }
    }

    /// Validates `block` against the per-type predicates, increments
    /// `totalNbOfWrites` (saturating), computes the CRC, and writes with read-back
    /// verification (§4.1).
    pub fn store_block(&mut self, idx: u16, block: &mut Block) -> EssResult<()> {
        self.check_idx(idx)?;
        self.check_next_block(idx, block.header.next_block)?;
        self.validate_for_store(idx, block)?;

        block.header.total_nb_of_writes = block.header.total_nb_of_writes.saturating_add(1);

        let mut buf = vec![0u8; block.header.n_bytes as usize];
        buf[0] = block.header.block_type as u8;
        buf[1] = block.header.section_name_hash;
        buf[2..4].copy_from_slice(&block.header.n_bytes.to_le_bytes());
        buf[4..8].copy_from_slice(&block.header.total_nb_of_writes.to_le_bytes());
        buf[8..10].copy_from_slice(&block.header.next_block.to_le_bytes());

        let body_end = buf.len() - CRC_LEN;
        match &block.body {
            BlockBody::Info {
                section_system_version,
                block_size,
                n_blocks,
            } => {
                buf[HEADER_LEN..HEADER_LEN + 2].copy_from_slice(&section_system_version.to_le_bytes());
                buf[HEADER_LEN + 2..HEADER_LEN + 4].copy_from_slice(&block_size.to_le_bytes());
                buf[HEADER_LEN + 4..HEADER_LEN + 6].copy_from_slice(&n_blocks.to_le_bytes());
            }
            BlockBody::Free => {}
            BlockBody::Head { version, name } => {
                buf[HEADER_LEN..HEADER_LEN + 2].copy_from_slice(&version.to_le_bytes());
                let name_start = HEADER_LEN + 2;
                buf[name_start..name_start + name.len()].copy_from_slice(name.as_bytes());
                buf[name_start + name.len()] = 0;
            }
            BlockBody::Data { seq_nb, payload } => {
                buf[HEADER_LEN..HEADER_LEN + 2].copy_from_slice(&seq_nb.to_le_bytes());
                buf[HEADER_LEN + 2..HEADER_LEN + 2 + payload.len()].copy_from_slice(payload);
            }
        }

        let crc = crc16_ccitt_false(&buf[..body_end]);
        buf[body_end..].copy_from_slice(&crc.to_le_bytes());

        self.device
            .write_and_check(self.addr_of(idx), &buf)
            .map_err(|e| {
                warn!("write-and-check failed for block {idx}: {e}");
                match e {
                    block_device::DeviceError::ReadBackMismatch { .. } => {
                        EssError::VolatileStorage { idx }
                    }
                    other => EssError::Io(other),
                }
            })?;
        Ok(())
    }

    fn validate_for_store(&self, idx: u16, block: &Block) -> EssResult<()> {
        let expected_n_bytes = match &block.body {
            BlockBody::Info { .. } => info_n_bytes(),
            BlockBody::Free => free_n_bytes(),
            BlockBody::Head { name, .. } => head_n_bytes(name.len()),
            BlockBody::Data { payload, .. } => data_n_bytes(payload.len()),
        };
        if block.header.n_bytes != expected_n_bytes {
            return Err(EssError::LogicError {
                reason: format!(
                    "nBytes {} does not match computed {expected_n_bytes} for block {idx}",
                    block.header.n_bytes
                ),
            });
        }
        if block.header.n_bytes as u32 > self.block_size {
            return Err(EssError::LogicError {
                reason: format!("block {idx} content exceeds block size {}", self.block_size),
            });
        }
        match &block.body {
            BlockBody::Info { .. } => {
                if block.header.section_name_hash != 0 || block.header.next_block != NOBLOCK {
                    return Err(EssError::LogicError {
                        reason: "malformed info block".into(),
                    });
                }
            }
            BlockBody::Free => {
                if block.header.section_name_hash != 0 {
                    return Err(EssError::LogicError {
                        reason: "free block must not carry a name hash".into(),
                    });
                }
            }
            BlockBody::Head { name, .. } => {
                if name.is_empty() || hash_name(name) != block.header.section_name_hash {
                    return Err(EssError::LogicError {
                        reason: "head block name/hash mismatch".into(),
                    });
                }
                if block.header.next_block == NOBLOCK {
                    return Err(EssError::LogicError {
                        reason: "head block must reference a data chain".into(),
                    });
                }
            }
            BlockBody::Data { seq_nb, .. } => {
                if block.header.section_name_hash != 0 {
                    return Err(EssError::LogicError {
                        reason: "data block must not carry a name hash".into(),
                    });
                }
                if *seq_nb as u32 > self.n_blocks as u32 - 2 {
                    return Err(EssError::LogicError {
                        reason: format!("seqNb {seq_nb} exceeds N-2"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemoryDevice;

    fn accessor(n_blocks: u32, block_size: u32) -> BlockAccessor<MemoryDevice> {
        let mut acc = BlockAccessor::new(MemoryDevice::new((n_blocks * block_size) as usize));
        acc.configure_block_size(block_size).unwrap();
        acc
    }

    #[test]
    fn info_block_round_trips() {
        let mut acc = accessor(4, 32);
        let mut block = Block::new_info(32, 4, 0);
        acc.store_block(0, &mut block).unwrap();
        let loaded = acc.load_block(0).unwrap();
        match loaded.body {
            BlockBody::Info { block_size, n_blocks, .. } => {
                assert_eq!(block_size, 32);
                assert_eq!(n_blocks, 4);
            }
            _ => panic!("expected info block"),
        }
        assert_eq!(loaded.header.total_nb_of_writes, 1);
    }

    #[test]
    fn crc_corruption_is_detected() {
        let mut acc = accessor(4, 32);
        let mut block = Block::new_free(NOBLOCK, 0);
        acc.store_block(1, &mut block).unwrap();
        acc.device_mut().raw_mut()[1 * 32 + 11] ^= 0xFF;
        assert!(matches!(acc.load_block(1), Err(EssError::CrcError { idx: 1 })));
    }

    #[test]
    fn head_block_round_trips_with_name() {
        let mut acc = accessor(4, 64);
        let mut head = Block::new_head("config", 1, 2, 0);
        acc.store_block(1, &mut head).unwrap();
        let loaded = acc.load_block(1).unwrap();
        match loaded.body {
            BlockBody::Head { version, name } => {
                assert_eq!(version, 1);
                assert_eq!(name, "config");
            }
            _ => panic!("expected head block"),
        }
    }

    #[test]
    fn data_block_rejects_excessive_seq_nb() {
        let mut acc = accessor(4, 32);
        let mut block = Block::new_data(10, vec![1, 2], NOBLOCK, 0);
        assert!(acc.store_block(2, &mut block).is_err());
    }
}
