use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use carmen_types::error::Result;

/// The fixed page size of all paged files, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Index of a page within a paged file.
pub type PageId = u64;

/// The raw byte content of a single page.
pub type PageData = [u8; PAGE_SIZE];

/// A file abstraction exposing page-granular reads and writes.
///
/// Loading a page beyond the current file length zero-extends the file up to
/// and including that page. Implementations are not thread safe; callers
/// serialize access.
pub trait PagedFile {
    /// Reads the page with the given id into `dst`.
    fn load_page(&mut self, id: PageId, dst: &mut PageData) -> Result<()>;

    /// Writes the page with the given id from `src`.
    fn store_page(&mut self, id: PageId, src: &PageData) -> Result<()>;

    /// The number of pages currently covered by the file.
    fn num_pages(&self) -> u64;

    /// Syncs buffered writes to the underlying medium.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and releases the underlying resources.
    fn close(&mut self) -> Result<()>;
}

/// A paged file held entirely in memory, for tests and memory-backed stores.
pub struct InMemoryPagedFile {
    pages: Vec<Box<PageData>>,
}

impl InMemoryPagedFile {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    fn ensure_pages(&mut self, id: PageId) {
        while self.pages.len() <= id as usize {
            self.pages.push(Box::new([0u8; PAGE_SIZE]));
        }
    }
}

impl Default for InMemoryPagedFile {
    fn default() -> Self {
        Self::new()
    }
}

impl PagedFile for InMemoryPagedFile {
    fn load_page(&mut self, id: PageId, dst: &mut PageData) -> Result<()> {
        self.ensure_pages(id);
        dst.copy_from_slice(&self.pages[id as usize][..]);
        Ok(())
    }

    fn store_page(&mut self, id: PageId, src: &PageData) -> Result<()> {
        self.ensure_pages(id);
        self.pages[id as usize].copy_from_slice(src);
        Ok(())
    }

    fn num_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A paged file backed by a single file on disk.
pub struct SingleFile {
    file: File,
    num_pages: u64,
}

impl SingleFile {
    /// Opens (or creates) the file at the given path. A pre-existing file
    /// must have a page-aligned length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(carmen_types::CarmenError::Internal(format!(
                "page file {} has a non-page-aligned length of {} bytes",
                path.as_ref().display(),
                len
            )));
        }
        Ok(Self { file, num_pages: len / PAGE_SIZE as u64 })
    }
}

impl PagedFile for SingleFile {
    fn load_page(&mut self, id: PageId, dst: &mut PageData) -> Result<()> {
        if id >= self.num_pages {
            // Zero-extend the file to cover the requested page.
            self.file.set_len((id + 1) * PAGE_SIZE as u64)?;
            self.num_pages = id + 1;
            dst.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        self.file.read_exact(dst)?;
        Ok(())
    }

    fn store_page(&mut self, id: PageId, src: &PageData) -> Result<()> {
        self.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        self.file.write_all(src)?;
        if id >= self.num_pages {
            self.num_pages = id + 1;
        }
        Ok(())
    }

    fn num_pages(&self) -> u64 {
        self.num_pages
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}
