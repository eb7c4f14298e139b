//! Block volume implementations.
//!
//! Two backends implement [`BlockVolume`]: `MemoryVolume` keeps pages
//! in a plain vector (tests, throwaway databases), `FileVolume` maps
//! logical pages onto a single file with a header page, a free-page
//! list threaded through freed pages, and a clean-shutdown flag that
//! drives the needs-recovery check at open time.

use byteorder::{BigEndian, ByteOrder};
use orion_core::{BlockVolume, Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Magic bytes identifying a volume file: "ORVL"
pub const VOLUME_MAGIC: [u8; 4] = *b"ORVL";

/// Current volume format version
pub const VOLUME_FORMAT_VERSION: u32 = 1;

/// Encoded size of the volume header at the start of page 0.
const VOLUME_HEADER_SIZE: usize = 4 + 4 + 4 + 16 + 1 + 8 + 8;

fn check_page_io(page: u64, offset: usize, len: usize, page_size: usize) -> Result<()> {
    if page == 0 {
        return Err(Error::corrupt("page 0 is the volume header"));
    }
    if offset + len > page_size {
        return Err(Error::corrupt(format!(
            "page I/O past page end: offset {offset} + {len} > {page_size}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryVolume
// ---------------------------------------------------------------------------

struct MemInner {
    /// Index = logical page offset; slot 0 stays empty (header page).
    pages: Vec<Option<Vec<u8>>>,
    free: Vec<u64>,
    allocated: u64,
}

/// Volatile in-memory volume. Pages live in a vector; freed pages are
/// dropped so that use-after-free surfaces as an error in tests.
pub struct MemoryVolume {
    page_size: usize,
    max_pages: Option<u64>,
    inner: Mutex<MemInner>,
}

impl MemoryVolume {
    /// Create an empty volume.
    pub fn new(page_size: usize, max_pages: Option<u64>) -> Self {
        MemoryVolume {
            page_size,
            max_pages,
            inner: Mutex::new(MemInner {
                pages: vec![None],
                free: Vec::new(),
                allocated: 0,
            }),
        }
    }

    /// Number of currently allocated pages.
    pub fn allocated_pages(&self) -> u64 {
        self.inner.lock().allocated
    }
}

impl BlockVolume for MemoryVolume {
    fn load_page(&self, buf: &mut [u8], page: u64, offset: usize) -> Result<()> {
        check_page_io(page, offset, buf.len(), self.page_size)?;
        let inner = self.inner.lock();
        let data = inner
            .pages
            .get(page as usize)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| Error::corrupt(format!("load of unallocated page {page}")))?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn store_page(&self, buf: &[u8], page: u64, offset: usize) -> Result<()> {
        check_page_io(page, offset, buf.len(), self.page_size)?;
        let mut inner = self.inner.lock();
        let data = inner
            .pages
            .get_mut(page as usize)
            .and_then(|p| p.as_mut())
            .ok_or_else(|| Error::corrupt(format!("store to unallocated page {page}")))?;
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn allocate_page(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some(max) = self.max_pages {
            if inner.allocated >= max {
                return Err(Error::NoMoreSpace);
            }
        }
        let page = match inner.free.pop() {
            Some(page) => {
                inner.pages[page as usize] = Some(vec![0; self.page_size]);
                page
            }
            None => {
                let page = inner.pages.len() as u64;
                inner.pages.push(Some(vec![0; self.page_size]));
                page
            }
        };
        inner.allocated += 1;
        Ok(page)
    }

    fn free_page(&self, page: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .pages
            .get_mut(page as usize)
            .ok_or_else(|| Error::corrupt(format!("free of unknown page {page}")))?;
        if slot.take().is_none() {
            return Err(Error::corrupt(format!("double free of page {page}")));
        }
        inner.free.push(page);
        inner.allocated -= 1;
        Ok(())
    }

    fn sync_all_pages(&self) -> Result<()> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FileVolume
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FileInner {
    file: File,
    free_head: u64,
    page_count: u64,
}

/// Single-file volume.
///
/// Page 0 holds the header; logical pages map 1:1 onto file offsets.
/// Freed pages form a list threaded through their own first 8 bytes.
/// The header's clean flag is cleared while the volume is open and set
/// again on close; an open that finds it cleared reports
/// [`Error::NeedsRecovery`].
#[derive(Debug)]
pub struct FileVolume {
    path: PathBuf,
    page_size: usize,
    max_pages: Option<u64>,
    uuid: Uuid,
    read_only: bool,
    /// Clean flag as found in the header at open time.
    clean_at_open: AtomicBool,
    inner: Mutex<FileInner>,
}

impl FileVolume {
    /// Create a new volume file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, page_size: usize, max_pages: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let uuid = Uuid::new_v4();
        let volume = FileVolume {
            path,
            page_size,
            max_pages,
            uuid,
            read_only: false,
            clean_at_open: AtomicBool::new(true),
            inner: Mutex::new(FileInner {
                file,
                free_head: 0,
                page_count: 1,
            }),
        };
        {
            let mut inner = volume.inner.lock();
            // Reserve the full header page up front
            inner.file.set_len(page_size as u64)?;
            volume.write_header(&mut inner, false)?;
            inner.file.sync_all()?;
        }
        debug!(target: "orion::volume", path = %volume.path.display(), %uuid, "volume created");
        Ok(volume)
    }

    /// Open an existing volume. Fails with [`Error::NeedsRecovery`] if
    /// it was not closed cleanly.
    pub fn open(path: impl AsRef<Path>, max_pages: Option<u64>) -> Result<Self> {
        let volume = Self::open_unchecked(path, max_pages)?;
        if !volume.was_clean() {
            return Err(Error::NeedsRecovery);
        }
        volume.mark_dirty()?;
        Ok(volume)
    }

    /// Open without the clean-shutdown check, for the recovery path.
    /// The volume is marked dirty; [`FileVolume::close`] marks it clean
    /// again.
    pub fn open_unchecked(path: impl AsRef<Path>, max_pages: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; VOLUME_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if header[0..4] != VOLUME_MAGIC {
            return Err(Error::corrupt("bad volume magic"));
        }
        let version = BigEndian::read_u32(&header[4..8]);
        if version != VOLUME_FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported volume format version {version}"
            )));
        }
        let page_size = BigEndian::read_u32(&header[8..12]) as usize;
        let uuid = Uuid::from_bytes(header[12..28].try_into().expect("16 uuid bytes"));
        let clean = header[28] == 1;
        let free_head = BigEndian::read_u64(&header[29..37]);
        let page_count = BigEndian::read_u64(&header[37..45]);

        let volume = FileVolume {
            path,
            page_size,
            max_pages,
            uuid,
            read_only: false,
            clean_at_open: AtomicBool::new(clean),
            inner: Mutex::new(FileInner {
                file,
                free_head,
                page_count,
            }),
        };
        Ok(volume)
    }

    /// Whether the header said "cleanly closed" when opened.
    pub fn was_clean(&self) -> bool {
        self.clean_at_open.load(Ordering::Relaxed)
    }

    /// Volume identity stamped at creation.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn mark_dirty(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_header(&mut inner, false)?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Flush everything and set the clean flag. Call exactly once at
    /// shutdown; further I/O through this handle is a caller bug.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        self.write_header(&mut inner, true)?;
        inner.file.sync_all()?;
        debug!(target: "orion::volume", path = %self.path.display(), "volume closed clean");
        Ok(())
    }

    fn write_header(&self, inner: &mut FileInner, clean: bool) -> Result<()> {
        let mut header = [0u8; VOLUME_HEADER_SIZE];
        header[0..4].copy_from_slice(&VOLUME_MAGIC);
        BigEndian::write_u32(&mut header[4..8], VOLUME_FORMAT_VERSION);
        BigEndian::write_u32(&mut header[8..12], self.page_size as u32);
        header[12..28].copy_from_slice(self.uuid.as_bytes());
        header[28] = clean as u8;
        BigEndian::write_u64(&mut header[29..37], inner.free_head);
        BigEndian::write_u64(&mut header[37..45], inner.page_count);
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&header)?;
        Ok(())
    }

    fn check_allocated(&self, inner: &FileInner, page: u64) -> Result<()> {
        if page >= inner.page_count {
            return Err(Error::corrupt(format!(
                "page {page} out of range (page count {})",
                inner.page_count
            )));
        }
        Ok(())
    }
}

impl BlockVolume for FileVolume {
    fn load_page(&self, buf: &mut [u8], page: u64, offset: usize) -> Result<()> {
        check_page_io(page, offset, buf.len(), self.page_size)?;
        let mut inner = self.inner.lock();
        self.check_allocated(&inner, page)?;
        let pos = page * self.page_size as u64 + offset as u64;
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    fn store_page(&self, buf: &[u8], page: u64, offset: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::corrupt("write to read-only volume"));
        }
        check_page_io(page, offset, buf.len(), self.page_size)?;
        let mut inner = self.inner.lock();
        self.check_allocated(&inner, page)?;
        let pos = page * self.page_size as u64 + offset as u64;
        inner.file.seek(SeekFrom::Start(pos))?;
        inner.file.write_all(buf)?;
        Ok(())
    }

    fn allocate_page(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let page = if inner.free_head != 0 {
            let page = inner.free_head;
            let mut next_buf = [0u8; 8];
            let pos = page * self.page_size as u64;
            inner.file.seek(SeekFrom::Start(pos))?;
            inner.file.read_exact(&mut next_buf)?;
            let next = BigEndian::read_u64(&next_buf);
            if next != 0 && next >= inner.page_count {
                return Err(Error::corrupt(format!(
                    "free-list pointer {next} out of range"
                )));
            }
            inner.free_head = next;
            // Hand the page back zeroed, like a freshly extended one
            let zeros = vec![0u8; self.page_size];
            inner.file.seek(SeekFrom::Start(pos))?;
            inner.file.write_all(&zeros)?;
            page
        } else {
            if let Some(max) = self.max_pages {
                if inner.page_count >= max {
                    return Err(Error::NoMoreSpace);
                }
            }
            let page = inner.page_count;
            let zeros = vec![0u8; self.page_size];
            inner.file.seek(SeekFrom::Start(page * self.page_size as u64))?;
            inner.file.write_all(&zeros)?;
            inner.page_count += 1;
            page
        };
        self.write_header(&mut inner, false)?;
        Ok(page)
    }

    fn free_page(&self, page: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_allocated(&inner, page)?;
        if page == 0 {
            return Err(Error::corrupt("cannot free the header page"));
        }
        let mut next_buf = [0u8; 8];
        BigEndian::write_u64(&mut next_buf, inner.free_head);
        inner.file.seek(SeekFrom::Start(page * self.page_size as u64))?;
        inner.file.write_all(&next_buf)?;
        inner.free_head = page;
        self.write_header(&mut inner, false)?;
        Ok(())
    }

    fn sync_all_pages(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
