use crate::memory_domain::{AddressTranslator, RemoteMemory};
use log::{debug, warn};
use remote_commons::{RemoteError, RemoteResult};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
};

/// Granularity of the windows handed out in the remote address space
pub const WINDOW_ALIGNMENT: u64 = 4096;

/// Contiguous memory visible to both domains.
/// The calling domain addresses it through the address of its backing storage,
/// the target domain through the window it was assigned in the shared address space.
#[derive(Debug)]
pub struct MemoryRegion {
    storage: RwLock<Box<[u8]>>,
    local_base: usize,
    remote_base: u64,
    size: usize,
}

impl MemoryRegion {
    fn new(size: usize, remote_base: u64) -> RemoteResult<Self> {
        let mut mem_space = Vec::new();
        if mem_space.try_reserve_exact(size).is_err() {
            return Err(RemoteError::OutOfMemory);
        }
        mem_space.resize(size, 0u8);
        let storage = mem_space.into_boxed_slice();
        let local_base = storage.as_ptr() as usize;
        return Ok(MemoryRegion {
            storage: RwLock::new(storage),
            local_base,
            remote_base,
            size,
        });
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Caller side address of the byte at offset
    pub fn local_address(&self, offset: usize) -> usize {
        self.local_base + offset
    }

    /// Target side address of the byte at offset
    pub fn remote_address(&self, offset: usize) -> u64 {
        self.remote_base + offset as u64
    }

    fn local_offset(&self, local: usize, size: usize) -> Option<usize> {
        let offset = local.checked_sub(self.local_base)?;
        let end = offset.checked_add(size)?;
        if end <= self.size {
            Some(offset)
        } else {
            None
        }
    }

    fn remote_offset(&self, remote: u64, size: usize) -> Option<usize> {
        let offset = usize::try_from(remote.checked_sub(self.remote_base)?).ok()?;
        let end = offset.checked_add(size)?;
        if end <= self.size {
            Some(offset)
        } else {
            None
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> RemoteResult<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(RemoteError::InvalidWrite)?;
        if end > self.size {
            return Err(RemoteError::InvalidWrite);
        }
        let mut storage = self
            .storage
            .write()
            .expect("Failed to get write lock for region storage (lock is poisoned)!");
        storage[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, read_size: usize) -> RemoteResult<Vec<u8>> {
        let end = offset
            .checked_add(read_size)
            .ok_or(RemoteError::InvalidRead)?;
        if end > self.size {
            return Err(RemoteError::InvalidRead);
        }
        let storage = self
            .storage
            .read()
            .expect("Failed to get read lock for region storage (lock is poisoned)!");
        Ok(storage[offset..end].to_vec())
    }
}

struct DomainState {
    /// regions by remote base address
    regions: BTreeMap<u64, Arc<MemoryRegion>>,
    /// unassigned windows, start to one past the end
    free_windows: BTreeMap<u64, u64>,
}

/// Memory shared between a calling domain and a target domain
pub struct SharedMemoryDomain {
    state: RwLock<DomainState>,
}

fn align_up(size: u64) -> Option<u64> {
    let rest = size % WINDOW_ALIGNMENT;
    if rest == 0 {
        Some(size)
    } else {
        size.checked_add(WINDOW_ALIGNMENT - rest)
    }
}

impl SharedMemoryDomain {
    /// Domain handing out windows of the remote address range starting at window_base.
    /// The base is rounded up to the window alignment, address 0 is never handed out.
    pub fn new(window_base: u64, window_size: u64) -> Self {
        let start = align_up(window_base.max(WINDOW_ALIGNMENT)).unwrap_or(u64::MAX);
        let end = window_base.saturating_add(window_size);
        let mut free_windows = BTreeMap::new();
        if end > start {
            free_windows.insert(start, end);
        }
        SharedMemoryDomain {
            state: RwLock::new(DomainState {
                regions: BTreeMap::new(),
                free_windows,
            }),
        }
    }

    pub fn acquire_region(&self, size: usize) -> RemoteResult<Arc<MemoryRegion>> {
        if size == 0 {
            return Err(RemoteError::InvalidArgument);
        }
        let window_size = align_up(size as u64).ok_or(RemoteError::OutOfMemory)?;
        let mut state = self
            .state
            .write()
            .expect("Failed to get write lock for domain state (lock is poisoned)!");
        // first window that is large enough
        let (window_start, window_end) = state
            .free_windows
            .iter()
            .find(|(start, end)| **end - **start >= window_size)
            .map(|(start, end)| (*start, *end))
            .ok_or(RemoteError::OutOfMemory)?;
        let region = Arc::new(MemoryRegion::new(size, window_start)?);
        state.free_windows.remove(&window_start);
        if window_end - window_start > window_size {
            state
                .free_windows
                .insert(window_start + window_size, window_end);
        }
        state.regions.insert(window_start, region.clone());
        debug!(
            "acquired region of size {} at local 0x{:x} remote 0x{:x}",
            size, region.local_base, region.remote_base
        );
        return Ok(region);
    }

    pub fn release_region(&self, region: &Arc<MemoryRegion>) -> RemoteResult<()> {
        let mut state = self
            .state
            .write()
            .expect("Failed to get write lock for domain state (lock is poisoned)!");
        if state.regions.remove(&region.remote_base).is_none() {
            return Err(RemoteError::InvalidArgument);
        }
        let mut start = region.remote_base;
        let mut end = start + align_up(region.size as u64).ok_or(RemoteError::InvalidArgument)?;
        // merge with the window after
        if let Some(next_end) = state.free_windows.remove(&end) {
            end = next_end;
        }
        // merge with the window before
        let previous = state
            .free_windows
            .range((Bound::Unbounded, Bound::Excluded(start)))
            .next_back()
            .map(|(previous_start, previous_end)| (*previous_start, *previous_end));
        if let Some((previous_start, previous_end)) = previous {
            if previous_end == start {
                state.free_windows.remove(&previous_start);
                start = previous_start;
            }
        }
        state.free_windows.insert(start, end);
        Ok(())
    }

    fn find_remote(&self, remote: u64, size: usize) -> Option<(Arc<MemoryRegion>, usize)> {
        let state = self
            .state
            .read()
            .expect("Failed to get read lock for domain state (lock is poisoned)!");
        let (_, region) = state.regions.range(..=remote).next_back()?;
        let offset = region.remote_offset(remote, size)?;
        Some((region.clone(), offset))
    }

    fn find_local(&self, local: usize, size: usize) -> Option<(Arc<MemoryRegion>, usize)> {
        let state = self
            .state
            .read()
            .expect("Failed to get read lock for domain state (lock is poisoned)!");
        state.regions.values().find_map(|region| {
            region
                .local_offset(local, size)
                .map(|offset| (region.clone(), offset))
        })
    }
}

impl AddressTranslator for SharedMemoryDomain {
    fn to_remote(&self, local: usize, size: usize) -> Option<u64> {
        let translated = self
            .find_local(local, size)
            .map(|(region, offset)| region.remote_address(offset));
        if translated.is_none() {
            warn!(
                "local buffer 0x{:x} of size {} is not in shared memory",
                local, size
            );
        }
        translated
    }

    fn to_local(&self, remote: u64, size: usize) -> Option<usize> {
        let translated = self
            .find_remote(remote, size)
            .map(|(region, offset)| region.local_address(offset));
        if translated.is_none() {
            warn!(
                "remote buffer 0x{:x} of size {} is not in shared memory",
                remote, size
            );
        }
        translated
    }
}

impl RemoteMemory for SharedMemoryDomain {
    fn read(&self, remote: u64, size: usize) -> RemoteResult<Vec<u8>> {
        let (region, offset) = self
            .find_remote(remote, size)
            .ok_or(RemoteError::InvalidRead)?;
        region.read(offset, size)
    }

    fn write(&self, remote: u64, data: &[u8]) -> RemoteResult<()> {
        let (region, offset) = self
            .find_remote(remote, data.len())
            .ok_or(RemoteError::InvalidWrite)?;
        region.write(offset, data)
    }
}
