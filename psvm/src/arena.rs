//! The arena is one growable byte buffer addressed purely by offsets.
//!
//! Growth may move the underlying mapping, so nothing outside this module
//! ever sees a pointer into it. Byte access goes through borrowed slices,
//! which means a slice obtained before a growing call cannot outlive it.
use std::{fs::File, os::fd::AsRawFd};

use log::{debug, error, trace};

use crate::{VmError, system::Region};

/// Every allocation is rounded up to this many bytes.
pub const ARENA_ALIGN: u32 = 8;

#[derive(Debug)]
pub enum ArenaBacking {
    Anonymous,
    /// Pages are shared with the file, which is resized along with the arena.
    File(File),
}

#[derive(Debug)]
pub struct Arena {
    region: Option<Region>,
    // keeps the descriptor of a file backed region open
    file: Option<File>,
    used: u32,
    max: u32,
    page_size: u32,
    limit: u32,
}

#[inline]
pub(crate) fn align_up(value: u32, align: u32) -> Option<u32> {
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

impl Arena {
    /// Map an arena of at least `initial` bytes that may later grow up to `limit`.
    pub fn init(
        backing: ArenaBacking,
        initial: u32,
        page_size: u32,
        limit: u32,
    ) -> Result<Self, VmError> {
        let max = align_up(initial.max(1), page_size).ok_or(VmError::LimitCheck)?;
        if max > limit {
            return Err(VmError::LimitCheck);
        }
        let (region, file) = match backing {
            ArenaBacking::Anonymous => (Region::anonymous(max as usize), None),
            ArenaBacking::File(file) => {
                let region = Region::file(file.as_raw_fd(), max as usize);
                (region, Some(file))
            }
        };
        let Some(region) = region else {
            error!("failed to map an arena of {max} bytes");
            return Err(VmError::VmFull);
        };
        debug!("arena mapped: {max} bytes, file backed: {}", file.is_some());
        Ok(Self {
            region: Some(region),
            file,
            used: 0,
            max,
            page_size,
            limit,
        })
    }

    /// Release the mapping. Every later call reports [`VmError::Uninitialized`].
    pub fn exit(&mut self) {
        if self.region.take().is_some() {
            debug!("arena released after using {} of {} bytes", self.used, self.max);
        }
        self.file = None;
        self.used = 0;
        self.max = 0;
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Bump allocate `size` bytes and return their offset, growing first if needed.
    pub fn alloc(&mut self, size: u32) -> Result<u32, VmError> {
        self.region()?;
        let size = align_up(size, ARENA_ALIGN).ok_or(VmError::VmFull)?;
        let end = self.used.checked_add(size).ok_or(VmError::VmFull)?;
        if end > self.max {
            self.grow(end - self.max)?;
        }
        let offset = self.used;
        self.used = end;
        trace!("arena alloc {size} bytes at {offset}");
        Ok(offset)
    }

    /// Add at least `extra` bytes of capacity, rounded up to whole pages.
    pub fn grow(&mut self, extra: u32) -> Result<(), VmError> {
        let extra = align_up(extra.max(1), self.page_size).ok_or(VmError::VmFull)?;
        let new_max = self.max.checked_add(extra).ok_or(VmError::VmFull)?;
        if new_max > self.limit {
            debug!("arena growth to {new_max} bytes refused, limit is {}", self.limit);
            return Err(VmError::VmFull);
        }
        let region = self.region_mut()?;
        if !region.resize(new_max as usize) {
            debug!("arena growth to {new_max} bytes failed");
            return Err(VmError::VmFull);
        }
        debug!("arena grew from {} to {new_max} bytes", self.max);
        self.max = new_max;
        Ok(())
    }

    /// Rewind the bump cursor, used by restore. Bytes above `used` are zeroed
    /// so recycled space looks like fresh space.
    pub(crate) fn truncate(&mut self, used: u32) -> Result<(), VmError> {
        if used > self.used {
            return Err(VmError::RangeCheck);
        }
        let old = self.used as usize;
        self.region_mut()?.as_mut_slice()[used as usize..old].fill(0);
        self.used = used;
        Ok(())
    }

    pub fn bytes(&self, offset: u32, len: u32) -> Result<&[u8], VmError> {
        let (start, end) = self.span(offset, len)?;
        Ok(&self.region()?.as_slice()[start..end])
    }

    pub fn bytes_mut(&mut self, offset: u32, len: u32) -> Result<&mut [u8], VmError> {
        let (start, end) = self.span(offset, len)?;
        Ok(&mut self.region_mut()?.as_mut_slice()[start..end])
    }

    /// Copy `len` bytes inside the arena, the ranges may overlap.
    pub fn copy_within(&mut self, from: u32, to: u32, len: u32) -> Result<(), VmError> {
        self.span(from, len)?;
        let (dst, _) = self.span(to, len)?;
        let from = from as usize;
        self.region_mut()?
            .as_mut_slice()
            .copy_within(from..from + len as usize, dst);
        Ok(())
    }

    fn span(&self, offset: u32, len: u32) -> Result<(usize, usize), VmError> {
        let end = offset.checked_add(len).ok_or(VmError::RangeCheck)?;
        if end > self.used {
            return Err(VmError::RangeCheck);
        }
        Ok((offset as usize, end as usize))
    }

    fn region(&self) -> Result<&Region, VmError> {
        self.region.as_ref().ok_or_else(|| {
            error!("arena used after exit");
            VmError::Uninitialized
        })
    }

    fn region_mut(&mut self) -> Result<&mut Region, VmError> {
        self.region.as_mut().ok_or_else(|| {
            error!("arena used after exit");
            VmError::Uninitialized
        })
    }
}
