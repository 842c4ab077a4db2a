//! Page allocator shim and the `BackingStore` collaborator it translates
//! offsets against.
//!
//! The engine never opens a file or maps memory itself — that is the
//! external storage component's job (spec'd as an out-of-scope
//! collaborator). `BackingStore` is the narrow seam between the two: grow
//! the region, and hand out shared or exclusive views of one page at a
//! time. `MemBackingStore` and `MmapBackingStore` below are reference
//! implementations, not the engine's own I/O path.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{EngineError, Result};
use crate::storage::meta::{get_free_list, get_next_offset, set_free_list, set_next_offset};
use crate::storage::page::{page_init, read_i64, write_i64, PageType, PAGE_SIZE};

/// Byte-addressable region divided into 4096-byte pages, borrowed by
/// offset. Implementations own the actual storage (heap buffer, mmap,
/// file); the engine only ever sees bounded page-sized views into it.
pub trait BackingStore {
    /// Grow the region so that the page starting at `offset` is
    /// addressable. A no-op if it already is.
    fn ensure_capacity(&mut self, offset: i64) -> Result<()>;

    /// Shared view of the page at `offset`.
    fn page_ref(&self, offset: i64) -> Result<&[u8; PAGE_SIZE]>;

    /// Exclusive view of the page at `offset`.
    fn page_mut(&mut self, offset: i64) -> Result<&mut [u8; PAGE_SIZE]>;

    /// Number of bytes currently addressable.
    fn len(&self) -> i64;
}

fn bounds_check(store_len: i64, offset: i64) -> Result<()> {
    if offset < 0 || offset % PAGE_SIZE as i64 != 0 {
        return Err(EngineError::Corruption {
            offset,
            detail: "offset is not a non-negative multiple of PAGE_SIZE".to_string(),
        });
    }
    if offset + PAGE_SIZE as i64 > store_len {
        return Err(EngineError::Corruption {
            offset,
            detail: "offset is outside the backing region".to_string(),
        });
    }
    Ok(())
}

/// `alloc_page`: pop the free list if non-empty, else bump `NextOffset`.
pub fn alloc_page(store: &mut dyn BackingStore, meta_offset: i64) -> Result<i64> {
    let free_head = {
        let meta = store.page_ref(meta_offset)?;
        get_free_list(meta)
    };

    if free_head != 0 {
        let next_free = {
            let page = store.page_ref(free_head)?;
            read_i64(page, 0)
        };
        {
            let meta = store.page_mut(meta_offset)?;
            set_free_list(meta, next_free);
        }
        let page = store.page_mut(free_head)?;
        page_init(page, PageType::None, 0);
        return Ok(free_head);
    }

    let offset = {
        let meta = store.page_ref(meta_offset)?;
        get_next_offset(meta)
    };
    let new_next = offset
        .checked_add(PAGE_SIZE as i64)
        .ok_or(EngineError::OutOfSpace {
            attempted_offset: offset,
        })?;
    store.ensure_capacity(offset)?;
    let meta = store.page_mut(meta_offset)?;
    set_next_offset(meta, new_next);
    Ok(offset)
}

/// `free_page`: link `offset` onto the head of the free list. The page's
/// bytes remain on disk; only its first 8 bytes (the next-free pointer)
/// are overwritten.
pub fn free_page(store: &mut dyn BackingStore, meta_offset: i64, offset: i64) -> Result<()> {
    let old_head = {
        let meta = store.page_ref(meta_offset)?;
        get_free_list(meta)
    };
    {
        let page = store.page_mut(offset)?;
        write_i64(page, 0, old_head);
    }
    let meta = store.page_mut(meta_offset)?;
    set_free_list(meta, offset);
    Ok(())
}

/// Backing store that lives entirely in a `Vec<u8>`. Used by the unit and
/// integration tests and by callers that don't need persistence.
pub struct MemBackingStore {
    data: Vec<u8>,
}

impl MemBackingStore {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(pages: usize) -> Self {
        Self {
            data: vec![0u8; pages * PAGE_SIZE],
        }
    }
}

impl Default for MemBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemBackingStore {
    fn ensure_capacity(&mut self, offset: i64) -> Result<()> {
        let needed = offset as usize + PAGE_SIZE;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
        Ok(())
    }

    fn page_ref(&self, offset: i64) -> Result<&[u8; PAGE_SIZE]> {
        bounds_check(self.data.len() as i64, offset)?;
        let start = offset as usize;
        Ok((&self.data[start..start + PAGE_SIZE]).try_into().unwrap())
    }

    fn page_mut(&mut self, offset: i64) -> Result<&mut [u8; PAGE_SIZE]> {
        bounds_check(self.data.len() as i64, offset)?;
        let start = offset as usize;
        Ok((&mut self.data[start..start + PAGE_SIZE]).try_into().unwrap())
    }

    fn len(&self) -> i64 {
        self.data.len() as i64
    }
}

/// File-backed store using a growable anonymous-then-flushed memory
/// mapping, in the spirit of the memory-mapped node files used elsewhere
/// in this corpus. Growing remaps: a fresh mapping is allocated at double
/// the old size (or the requested size, whichever is larger) and the old
/// bytes are copied across.
pub struct MmapBackingStore {
    file: File,
    mmap: MmapMut,
}

impl MmapBackingStore {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| e_to_corruption(0, "failed to create backing file"))?;
        Self::from_file(file, PAGE_SIZE as u64)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| e_to_corruption(0, "failed to open backing file"))?;
        let len = file
            .metadata()
            .map_err(|_| e_to_corruption(0, "failed to stat backing file"))?
            .len();
        Self::from_file(file, len.max(PAGE_SIZE as u64))
    }

    fn from_file(file: File, len: u64) -> Result<Self> {
        file.set_len(len)
            .map_err(|_| e_to_corruption(0, "failed to size backing file"))?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&file)
                .map_err(|_| e_to_corruption(0, "failed to map backing file"))?
        };
        Ok(Self { file, mmap })
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|_| e_to_corruption(0, "failed to flush backing file"))
    }
}

fn e_to_corruption(offset: i64, detail: &str) -> EngineError {
    EngineError::Corruption {
        offset,
        detail: detail.to_string(),
    }
}

impl BackingStore for MmapBackingStore {
    fn ensure_capacity(&mut self, offset: i64) -> Result<()> {
        let needed = offset as u64 + PAGE_SIZE as u64;
        if (self.mmap.len() as u64) >= needed {
            return Ok(());
        }
        let new_len = needed.max(self.mmap.len() as u64 * 2);
        self.file
            .set_len(new_len)
            .map_err(|_| e_to_corruption(offset, "failed to grow backing file"))?;
        let mmap = unsafe {
            MmapOptions::new()
                .len(new_len as usize)
                .map_mut(&self.file)
                .map_err(|_| e_to_corruption(offset, "failed to remap backing file"))?
        };
        self.mmap = mmap;
        Ok(())
    }

    fn page_ref(&self, offset: i64) -> Result<&[u8; PAGE_SIZE]> {
        bounds_check(self.mmap.len() as i64, offset)?;
        let start = offset as usize;
        Ok((&self.mmap[start..start + PAGE_SIZE]).try_into().unwrap())
    }

    fn page_mut(&mut self, offset: i64) -> Result<&mut [u8; PAGE_SIZE]> {
        bounds_check(self.mmap.len() as i64, offset)?;
        let start = offset as usize;
        Ok((&mut self.mmap[start..start + PAGE_SIZE]).try_into().unwrap())
    }

    fn len(&self) -> i64 {
        self.mmap.len() as i64
    }
}
