use std::{os::fd::RawFd, ptr::NonNull};

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_SHARED: i32 = 0x01;
    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MREMAP_MAYMOVE: i32 = 0x1;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and ftruncate, plus linux mremap
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn ftruncate(fd: i32, length: i64) -> i32;

        #[cfg(target_os = "linux")]
        pub fn mremap(
            old_address: *mut c_void,
            old_size: usize,
            new_size: usize,
            flags: i32,
            ...
        ) -> *mut c_void;
    }

    /// map `len` bytes, anonymous when `fd` is negative, shared file pages otherwise
    /// # Safety
    /// null must be checked, a file must already be at least `len` bytes long
    #[inline]
    pub unsafe fn map(len: usize, fd: i32) -> *mut u8 {
        let flags = if fd < 0 {
            MAP_PRIVATE | MAP_ANON
        } else {
            MAP_SHARED
        };
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// A contiguous mapping that can change size and, while doing so, move.
///
/// Contents in `[0, len)` survive every successful [`Region::resize`], newly
/// added bytes read as zero. A failed resize leaves the old mapping untouched.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    fd: Option<RawFd>,
}

impl Region {
    #[must_use]
    pub fn anonymous(len: usize) -> Option<Self> {
        // SAFETY: fresh anonymous mapping
        let ptr = NonNull::new(unsafe { unix::map(len, -1) })?;
        Some(Self { ptr, len, fd: None })
    }

    /// Map `len` bytes of `fd`, truncating or extending the file to fit.
    /// The descriptor must stay open for the lifetime of the region.
    #[must_use]
    pub fn file(fd: RawFd, len: usize) -> Option<Self> {
        // SAFETY: fd is owned by the caller
        if unsafe { unix::ftruncate(fd, len as i64) } != 0 {
            return None;
        }
        // SAFETY: the file is now exactly len bytes long
        let ptr = NonNull::new(unsafe { unix::map(len, fd) })?;
        Some(Self {
            ptr,
            len,
            fd: Some(fd),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_file_backed(&self) -> bool {
        self.fd.is_some()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for len bytes as long as self lives
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is valid for len bytes and we hold it exclusively
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Change the mapping size, possibly relocating it.
    pub fn resize(&mut self, new_len: usize) -> bool {
        if new_len == self.len {
            return true;
        }
        if let Some(fd) = self.fd {
            // SAFETY: fd is kept open by the owner of this region
            if unsafe { unix::ftruncate(fd, new_len as i64) } != 0 {
                return false;
            }
        }
        match self.remap(new_len) {
            Some(ptr) => {
                self.ptr = ptr;
                self.len = new_len;
                true
            }
            None => {
                if let Some(fd) = self.fd {
                    // put the file back the way the mapping expects it
                    // SAFETY: same descriptor as above
                    let _ = unsafe { unix::ftruncate(fd, self.len as i64) };
                }
                false
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn remap(&mut self, new_len: usize) -> Option<NonNull<u8>> {
        // SAFETY: ptr/len describe our own live mapping, MAYMOVE keeps it intact on failure
        let p = unsafe {
            unix::mremap(
                self.ptr.as_ptr().cast(),
                self.len,
                new_len,
                unix::MREMAP_MAYMOVE,
            )
        };
        if (p as isize) == unix::MAP_FAILED {
            return None;
        }
        NonNull::new(p.cast())
    }

    #[cfg(not(target_os = "linux"))]
    fn remap(&mut self, new_len: usize) -> Option<NonNull<u8>> {
        let fd = self.fd.unwrap_or(-1);
        // SAFETY: a file was already resized to new_len by the caller
        let fresh = NonNull::new(unsafe { unix::map(new_len, fd) })?;
        if self.fd.is_none() {
            let keep = self.len.min(new_len);
            // SAFETY: distinct mappings, both valid for at least `keep` bytes
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), fresh.as_ptr(), keep)
            };
        }
        // SAFETY: old mapping is no longer referenced
        unsafe { unix::unmap(self.ptr.as_ptr(), self.len) };
        Some(fresh)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr must be from mmap allocation
        unsafe { unix::unmap(self.ptr.as_ptr(), self.len) };
    }
}
