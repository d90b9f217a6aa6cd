//! Raw Device Abstraction
//!
//! The durable buffer pool writes through this trait. Each mirror partition
//! is its own device.
//!
//! ## Implementations
//!
//! - `MemoryDevice`: battery-backed memory stand-in for unit tests and DST
//! - `FileDevice`: a preallocated file, positional I/O + `sync_data`

use parking_lot::Mutex;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for raw durable media
pub trait RawDevice: Send + Sync + 'static {
    /// Write `data` at `offset`
    fn pwrite(&self, data: &[u8], offset: u64) -> Result<(), IoError>;
    /// Fill `buf` from `offset`
    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<(), IoError>;
    /// Hardware durability barrier
    fn force_durability(&self) -> Result<(), IoError>;
    /// Device size in bytes
    fn size(&self) -> u64;
}

// ============================================================================
// MemoryDevice - For unit tests and DST
// ============================================================================

#[derive(Debug)]
struct MemoryDeviceInner {
    image: Mutex<Vec<u8>>,
    writes: AtomicU64,
    flushes: AtomicU64,
    fail_writes: AtomicBool,
}

/// In-memory device. Clones share the same image, so a test can keep a
/// handle across a simulated restart.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    inner: Arc<MemoryDeviceInner>,
}

impl MemoryDevice {
    pub fn new(len: u64) -> Self {
        MemoryDevice {
            inner: Arc::new(MemoryDeviceInner {
                image: Mutex::new(vec![0u8; len as usize]),
                writes: AtomicU64::new(0),
                flushes: AtomicU64::new(0),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Number of successful `pwrite` calls
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Number of `force_durability` calls
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    /// Make every later write (and barrier) fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flip one byte of the image (for corruption tests)
    pub fn corrupt(&self, offset: u64) {
        let mut image = self.inner.image.lock();
        image[offset as usize] ^= 0xFF;
    }

    /// Copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.image.lock().clone()
    }

    fn check_range(&self, len: usize, offset: u64, image_len: usize) -> Result<usize, IoError> {
        let start = offset as usize;
        if start.checked_add(len).map_or(true, |end| end > image_len) {
            return Err(IoError::new(
                ErrorKind::UnexpectedEof,
                format!("access {}..+{} past device end {}", start, len, image_len),
            ));
        }
        Ok(start)
    }
}

impl RawDevice for MemoryDevice {
    fn pwrite(&self, data: &[u8], offset: u64) -> Result<(), IoError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected write failure"));
        }
        let mut image = self.inner.image.lock();
        let start = self.check_range(data.len(), offset, image.len())?;
        image[start..start + data.len()].copy_from_slice(data);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        let image = self.inner.image.lock();
        let start = self.check_range(buf.len(), offset, image.len())?;
        buf.copy_from_slice(&image[start..start + buf.len()]);
        Ok(())
    }

    fn force_durability(&self) -> Result<(), IoError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::Other, "injected flush failure"));
        }
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.image.lock().len() as u64
    }
}

// ============================================================================
// FileDevice - For production
// ============================================================================

/// Preallocated file used as a device partition
#[cfg(unix)]
#[derive(Debug)]
pub struct FileDevice {
    file: std::fs::File,
    len: u64,
}

#[cfg(unix)]
impl FileDevice {
    /// Open (creating if needed) and size the file to `len` bytes
    pub fn open(path: &std::path::Path, len: u64) -> Result<Self, IoError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(FileDevice { file, len })
    }
}

#[cfg(unix)]
impl RawDevice for FileDevice {
    fn pwrite(&self, data: &[u8], offset: u64) -> Result<(), IoError> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    fn force_durability(&self) -> Result<(), IoError> {
        self.file.sync_data()
    }

    fn size(&self) -> u64 {
        self.len
    }
}
