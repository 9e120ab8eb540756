//! ESS Engine (`spec.md` §4.8): the top-level coordinator. Owns state, the
//! `BlockAccessor`, `FreeBlockList` cache, and `NamedRWLock`, all behind one mutex
//! (§5's single-mutex concurrency model), realized as `Arc<Mutex<EngineInner>>` per
//! the redesign guidance in §9 ("model as one owned engine value with interior
//! mutex"). Reader/writer streams hold a clone of the same `Arc` so `M` is acquired
//! only for the duration of each individual block operation.

use std::sync::{Arc, Mutex};

use block_device::BlockDevice;
use log::{error, info};

use crate::block::{hash_name, BlockAccessor, BlockBody, HEAD_NAME_OVERHEAD, NOBLOCK};
use crate::error::{EssError, EssResult};
use crate::free_list::FreeBlockList;
use crate::lock::NamedRWLock;
use crate::mount;
use crate::reader::SectionReader;
use crate::search;
use crate::writer::SectionWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotMounted,
    RoMount,
    Checking,
    Mounted,
    Defect,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::NotMounted => "NotMounted",
            EngineState::RoMount => "RoMount",
            EngineState::Checking => "Checking",
            EngineState::Mounted => "Mounted",
            EngineState::Defect => "Defect",
        };
        write!(f, "{s}")
    }
}

fn is_media_corrupting(e: &EssError) -> bool {
    matches!(
        e,
        EssError::VolatileStorage { .. }
            | EssError::CrcError { .. }
            | EssError::InvalidHeader { .. }
            | EssError::BlockLinkage { .. }
            | EssError::LogicError { .. }
            | EssError::Io(_)
    )
}

pub(crate) struct EngineInner<D> {
    pub(crate) state: EngineState,
    pub(crate) device: Option<D>,
    pub(crate) accessor: Option<BlockAccessor<D>>,
    pub(crate) free_list: FreeBlockList,
    pub(crate) locks: NamedRWLock,
}

impl<D: BlockDevice> EngineInner<D> {
    fn accessor_mut(&mut self) -> EssResult<&mut BlockAccessor<D>> {
        self.accessor.as_mut().ok_or(EssError::InsufficientState {
            current: self.state.to_string(),
        })
    }

    fn require_state(&self, allowed: &[EngineState]) -> EssResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EssError::InsufficientState {
                current: self.state.to_string(),
            })
        }
    }

    fn max_name_len(&self) -> usize {
        self.accessor
            .as_ref()
            .map(|a| a.block_size() as usize - HEAD_NAME_OVERHEAD)
            .unwrap_or(0)
    }

    fn validate_name(&self, name: &str) -> EssResult<()> {
        if name.is_empty() || name != name.trim() {
            return Err(EssError::InvalidName {
                reason: "name must be non-empty with no leading/trailing space".into(),
            });
        }
        if name.len() > self.max_name_len() {
            return Err(EssError::InvalidName {
                reason: format!("name exceeds maximum length {}", self.max_name_len()),
            });
        }
        Ok(())
    }

    pub(crate) fn mark_defect_on<T>(&mut self, result: EssResult<T>) -> EssResult<T> {
        if let Err(e) = &result {
            if is_media_corrupting(e) {
                error!("engine transitioning to Defect: {e}");
                self.state = EngineState::Defect;
            }
        }
        result
    }
}

pub(crate) type Shared<D> = Arc<Mutex<EngineInner<D>>>;

/// Top-level coordinator, cheaply cloneable (all clones share the same mutex).
pub struct Engine<D> {
    inner: Shared<D>,
}

impl<D> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: BlockDevice> Engine<D> {
    pub fn new(device: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                state: EngineState::NotMounted,
                device: Some(device),
                accessor: None,
                free_list: FreeBlockList::empty(),
                locks: NamedRWLock::new(),
            })),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().unwrap().state
    }

    pub fn format(&self, block_size: u32) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::NotMounted])?;
        let device = inner.device.take().expect("device present while NotMounted");
        match mount::format(device, block_size) {
            Ok((accessor, free_list)) => {
                inner.accessor = Some(accessor);
                inner.free_list = free_list;
                inner.state = EngineState::Mounted;
                info!("engine formatted and mounted");
                Ok(())
            }
            Err(e) => {
                inner.state = EngineState::NotMounted;
                Err(e)
            }
        }
    }

    pub fn mount_step1(&self) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::NotMounted])?;
        let device = inner.device.take().expect("device present while NotMounted");
        match mount::mount_step1(device) {
            Ok(accessor) => {
                inner.accessor = Some(accessor);
                inner.state = EngineState::RoMount;
                Ok(())
            }
            Err(e) => {
                inner.state = EngineState::NotMounted;
                Err(e)
            }
        }
    }

    pub fn mount_step2(&self) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::RoMount, EngineState::Mounted, EngineState::Defect])?;
        if inner.locks.any_locks() {
            return Err(EssError::NotAllSectionsClosed {
                count: inner.locks.open_count(),
            });
        }
        inner.state = EngineState::Checking;
        let accessor = inner.accessor_mut()?;
        match mount::mount_step2(accessor) {
            Ok(free_list) => {
                inner.free_list = free_list;
                inner.state = EngineState::Mounted;
                info!("mount_step2 succeeded");
                Ok(())
            }
            Err(e) => {
                inner.state = EngineState::Defect;
                Err(e)
            }
        }
    }

    pub fn unmount(&self) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::RoMount, EngineState::Mounted, EngineState::Defect])?;
        if inner.locks.any_locks() {
            return Err(EssError::NotAllSectionsClosed {
                count: inner.locks.open_count(),
            });
        }
        let accessor = inner.accessor.take().expect("accessor present while mounted");
        inner.device = Some(accessor.into_device());
        inner.free_list = FreeBlockList::empty();
        inner.state = EngineState::NotMounted;
        Ok(())
    }

    pub fn open(&self, name: &str) -> EssResult<SectionReader<D>> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::RoMount, EngineState::Mounted])?;
        inner.validate_name(name)?;
        let hash = hash_name(name);
        let accessor = inner.accessor_mut()?;
        let head_idx = search::find_section_head(accessor, 1, name, hash)?
            .ok_or_else(|| EssError::NoSuchFile { name: name.to_string() })?;
        if !inner.locks.try_get_read(name) {
            return Err(EssError::FileAlreadyAccessed { name: name.to_string() });
        }
        SectionReader::open(self.inner.clone(), name.to_string(), head_idx)
    }

    pub fn create(&self, name: &str, overwrite: bool) -> EssResult<SectionWriter<D>> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        inner.validate_name(name)?;
        if !inner.locks.try_get_write(name) {
            return Err(EssError::FileAlreadyAccessed { name: name.to_string() });
        }
        let hash = hash_name(name);
        let existing = {
            let accessor = inner.accessor_mut()?;
            search::find_section_head(accessor, 1, name, hash)?
        };
        if existing.is_some() && !overwrite {
            inner.locks.release_write(name);
            return Err(EssError::FileAlreadyExisting { name: name.to_string() });
        }
        let allocated = {
            let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?;
            inner.free_list.alloc_n(accessor, 2)
        };
        let allocated = match allocated {
            Ok(Some(v)) => v,
            Ok(None) => {
                inner.locks.release_write(name);
                return Err(EssError::InsufficientSpace);
            }
            Err(e) => {
                inner.locks.release_write(name);
                return inner.mark_defect_on(Err(e));
            }
        };
        let new_head_idx = allocated[0].0;
        let first_data_idx = allocated[1].0;
        let first_data_prev_writes = allocated[1].1;
        let old_head_version = match existing {
            Some(idx) => {
                let accessor = inner.accessor_mut()?;
                match accessor.load_block(idx)? {
                    crate::block::Block {
                        body: BlockBody::Head { version, .. },
                        ..
                    } => Some(version),
                    _ => None,
                }
            }
            None => None,
        };
        Ok(SectionWriter::new(
            self.inner.clone(),
            name.to_string(),
            new_head_idx,
            allocated[0].1,
            first_data_idx,
            first_data_prev_writes,
            existing,
            old_head_version,
        ))
    }

    pub fn delete(&self, name: &str) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        inner.validate_name(name)?;
        if inner.locks.is_locked(name) {
            return Err(EssError::FileAlreadyAccessed { name: name.to_string() });
        }
        let hash = hash_name(name);
        let head_idx = {
            let accessor = inner.accessor_mut()?;
            search::find_section_head(accessor, 1, name, hash)?
        }
        .ok_or_else(|| EssError::NoSuchFile { name: name.to_string() })?;

        let result = {
            let accessor = inner.accessor.as_mut().unwrap();
            inner.free_list.free_chain(accessor, head_idx, NOBLOCK)
        };
        inner.mark_defect_on(result)
    }

    pub fn rename(&self, old: &str, new: &str) -> EssResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        inner.validate_name(old)?;
        inner.validate_name(new)?;
        if inner.locks.is_locked(old) || inner.locks.is_locked(new) {
            return Err(EssError::FileAlreadyAccessed { name: old.to_string() });
        }
        let new_hash = hash_name(new);
        let old_hash = hash_name(old);

        let already_exists = {
            let accessor = inner.accessor_mut()?;
            search::find_section_head(accessor, 1, new, new_hash)?.is_some()
        };
        if already_exists {
            return Err(EssError::FileAlreadyExisting { name: new.to_string() });
        }

        let old_head_idx = {
            let accessor = inner.accessor_mut()?;
            search::find_section_head(accessor, 1, old, old_hash)?
        }
        .ok_or_else(|| EssError::NoSuchFile { name: old.to_string() })?;

        let old_head = {
            let accessor = inner.accessor_mut()?;
            accessor.load_block(old_head_idx)?
        };
        let (old_version, data_chain_idx) = match &old_head.body {
            BlockBody::Head { version, .. } => (*version, old_head.header.next_block),
            _ => unreachable!("search only returns Head blocks"),
        };

        let allocated = {
            let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?;
            inner.free_list.alloc_one(accessor)
        };
        let (new_head_idx, prev_writes) = match allocated {
            Ok(Some(v)) => v,
            Ok(None) => return Err(EssError::InsufficientSpace),
            Err(e) => return inner.mark_defect_on(Err(e)),
        };

        let result = (|| -> EssResult<()> {
            let accessor = inner.accessor_mut()?;
            let mut new_head = crate::block::Block::new_head(
                new,
                old_version.wrapping_add(1),
                data_chain_idx,
                prev_writes,
            );
            accessor.store_block(new_head_idx, &mut new_head)?;
            Ok(())
        })();
        if let Err(e) = inner.mark_defect_on(result) {
            return Err(e);
        }

        let result = {
            let accessor = inner.accessor.as_mut().ok_or(EssError::InsufficientState {
                current: inner.state.to_string(),
            })?;
            inner
                .free_list
                .free_one(accessor, old_head_idx, old_head.header.total_nb_of_writes)
        };
        inner.mark_defect_on(result)
    }

    pub fn enumerate(&self) -> EssResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        let accessor = inner.accessor_mut()?;
        let n = accessor.n_blocks();
        let mut names = Vec::new();
        for idx in 1..n {
            if let Some((crate::block::BlockType::Head, _)) = accessor.peek_type_and_hash(idx)? {
                if let BlockBody::Head { name, .. } = accessor.load_block(idx)?.body {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn determine_size(&self, name: &str) -> EssResult<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        inner.validate_name(name)?;
        let hash = hash_name(name);
        let accessor = inner.accessor_mut()?;
        let head_idx = search::find_section_head(accessor, 1, name, hash)?
            .ok_or_else(|| EssError::NoSuchFile { name: name.to_string() })?;
        let head = accessor.load_block(head_idx)?;
        let block_size = accessor.block_size() as u64;
        let mut payload_bytes = 0u64;
        let mut total_bytes = block_size; // the Head block itself
        let mut cur = head.header.next_block;
        loop {
            let block = accessor.load_block(cur)?;
            total_bytes += block_size;
            if let BlockBody::Data { payload, .. } = &block.body {
                payload_bytes += payload.len() as u64;
            }
            if block.header.next_block == NOBLOCK {
                break;
            }
            cur = block.header.next_block;
        }
        Ok((payload_bytes, total_bytes))
    }

    pub fn get_free_space(&self) -> EssResult<u64> {
        let inner = self.inner.lock().unwrap();
        inner.require_state(&[EngineState::Mounted])?;
        let block_size = inner.accessor.as_ref().unwrap().block_size() as u64;
        let capacity_per_block = block_size.saturating_sub(14);
        Ok((inner.free_list.count() as u64).saturating_sub(1) * capacity_per_block)
    }
}
