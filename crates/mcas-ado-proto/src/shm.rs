//! Named shared-memory segments under `/dev/shm`.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

/// A mapped region of named shared memory. The creator owns the name
/// and unlinks it on drop.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

// SAFETY: the mapping itself is freely shareable; synchronization of the
// contents is the responsibility of the structures built on top.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn to_shm_name(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name has NUL"))
}

fn map(fd: &OwnedFd, size: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-size mapping"))?;
    // SAFETY: mapping a fresh shared file descriptor; no existing Rust
    // references alias the region.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) })
}

impl SharedMemory {
    /// Create a new named segment of `size` bytes, zero-filled.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let name = to_shm_name(name)?;
        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();
        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from_raw_os_error(e as i32));
        }
        match map(&fd, size) {
            Ok(ptr) => Ok(Self {
                ptr,
                size,
                name,
                fd: fd.into_raw_fd(),
                is_owner: true,
            }),
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(name.as_c_str());
                Err(e)
            }
        }
    }

    /// Open an existing named segment of `size` bytes.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        let name = to_shm_name(name)?;
        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let raw_fd = fd.as_raw_fd();
        match map(&fd, size) {
            Ok(ptr) => Ok(Self {
                ptr,
                size,
                name,
                fd: fd.into_raw_fd(),
                is_owner: false,
            }),
            Err(e) => {
                let _ = close(raw_fd);
                Err(e)
            }
        }
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapping size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap above.
        unsafe {
            let _ = munmap(NonNull::new_unchecked(self.ptr.as_ptr().cast()), self.size);
        }
        let _ = close(self.fd);
        if self.is_owner {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_share_bytes() {
        let name = format!("mcas-shm-test-{}", std::process::id());
        let a = SharedMemory::create(&name, 4096).unwrap();
        // SAFETY: fresh 4 KiB mapping.
        unsafe { std::ptr::write_volatile(a.as_ptr(), 0xA5u8) };
        let b = SharedMemory::open(&name, 4096).unwrap();
        let v = unsafe { std::ptr::read_volatile(b.as_ptr()) };
        assert_eq!(v, 0xA5);
    }

    #[test]
    fn test_create_existing_fails() {
        let name = format!("mcas-shm-test2-{}", std::process::id());
        let _a = SharedMemory::create(&name, 4096).unwrap();
        assert!(SharedMemory::create(&name, 4096).is_err());
    }
}
