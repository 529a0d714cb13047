use std::{
    io::Cursor,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use log::{debug, info};

use crate::{
    error::{IoKind, ShoalError},
    io::{read_exact_buf, Decodeable, ShoalFile, ShoalWriter},
    storage::page::{Page, PageId, PageKind, NO_PAGE, PAGE_HEADER_SIZE, PAGE_MAGIC},
    types::ShoalResult,
};

/// Durable, fixed-size page store.
///
/// Page 0 is the meta page: file magic, page size, free-list head and the
/// root-index registry. All other pages are allocated densely; freed pages
/// are chained through their right-sibling header field and reused before
/// the file grows.
pub struct PageFile {
    file: ShoalFile,
    page_size: usize,
    page_count: AtomicU64,
    /// Head of the free-page chain, `NO_PAGE` when empty.
    free_head: Mutex<PageId>,
    /// Opaque registry blob owned by the index catalog.
    registry: Mutex<Vec<u8>>,
}

impl PageFile {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> ShoalResult<Self> {
        let file = ShoalFile::open(&path)
            .map_err(|e| ShoalError::io(IoKind::Read, None, e))?;

        let len = file
            .get_size()
            .map_err(|e| ShoalError::io(IoKind::Read, None, e))?;

        // a partial tail from a crashed growth is dropped here
        let whole_pages = len / page_size as u64;
        if whole_pages * page_size as u64 != len {
            info!(
                "truncating partial tail: {} -> {} bytes",
                len,
                whole_pages * page_size as u64
            );
            file.set_len(whole_pages * page_size as u64)
                .map_err(|e| ShoalError::io(IoKind::Write, None, e))?;
        }

        let page_file = Self {
            file,
            page_size,
            page_count: AtomicU64::new(whole_pages.max(1)),
            free_head: Mutex::new(NO_PAGE),
            registry: Mutex::new(Vec::new()),
        };

        if whole_pages == 0 {
            // fresh file: lay down the meta page
            page_file.write_meta()?;
            page_file.sync()?;
        } else {
            page_file.read_meta()?;
        }

        Ok(page_file)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.load(Ordering::SeqCst)
    }

    pub fn read_page(&self, pid: PageId) -> ShoalResult<Vec<u8>> {
        if pid >= self.page_count() {
            return Err(ShoalError::NotFound);
        }
        self.file
            .read_at(pid * self.page_size as u64, self.page_size)
            .map_err(|e| ShoalError::read_err(pid, e))
    }

    pub fn write_page(&self, pid: PageId, bytes: &[u8]) -> ShoalResult<()> {
        assert_eq!(bytes.len(), self.page_size, "torn page write");
        if pid >= self.page_count() {
            return Err(ShoalError::NotFound);
        }
        self.file
            .write_at(pid * self.page_size as u64, bytes)
            .map_err(|e| ShoalError::write_err(pid, e))
    }

    /// Pop a page off the free list, or grow the file by one page.
    pub fn allocate_page(&self) -> ShoalResult<PageId> {
        let mut head = self.free_head.lock().unwrap();
        if *head != NO_PAGE {
            let pid = *head;
            let bytes = self.read_page(pid)?;
            let page = Page::from_bytes(pid, bytes)?;
            *head = page.right_sibling().unwrap_or(NO_PAGE);
            drop(head);
            self.write_meta()?;
            debug!("reused free page {}", pid);
            return Ok(pid);
        }
        drop(head);

        let pid = self.page_count.fetch_add(1, Ordering::SeqCst);
        self.file
            .write_at(pid * self.page_size as u64, &vec![0; self.page_size])
            .map_err(|e| ShoalError::write_err(pid, e))?;
        debug!("grew file to page {}", pid);
        Ok(pid)
    }

    /// Push a page onto the free list for reuse.
    pub fn free_page(&self, pid: PageId) -> ShoalResult<()> {
        assert_ne!(pid, 0, "cannot free the meta page");
        let mut head = self.free_head.lock().unwrap();
        let mut page = Page::new_empty(pid, self.page_size, PageKind::Free);
        page.set_right_sibling(*head);
        self.write_page(pid, page.data())?;
        *head = pid;
        drop(head);
        self.write_meta()?;
        debug!("freed page {}", pid);
        Ok(())
    }

    /// Durability barrier: every earlier `write_page` is persisted before
    /// this returns.
    pub fn sync(&self) -> ShoalResult<()> {
        self.file.sync().map_err(ShoalError::sync_err)
    }

    pub fn registry_blob(&self) -> Vec<u8> {
        self.registry.lock().unwrap().clone()
    }

    pub fn set_registry_blob(&self, blob: Vec<u8>) -> ShoalResult<()> {
        *self.registry.lock().unwrap() = blob;
        self.write_meta()
    }

    /// Meta page body: page_size (4B) | free_list_head (8B) |
    /// registry_len (4B) | registry bytes. Header integers big-endian like
    /// everything else.
    fn write_meta(&self) -> ShoalResult<()> {
        let registry = self.registry.lock().unwrap().clone();
        let free_head = *self.free_head.lock().unwrap();

        let mut writer = ShoalWriter::new();
        let mut page = Page::new_empty(0, self.page_size, PageKind::Meta);
        writer.write(&(self.page_size as u32));
        writer.write(&free_head);
        writer.write(&(registry.len() as u32));
        writer.write_bytes(&registry);

        let body = writer.to_bytes();
        let cap = self.page_size - PAGE_HEADER_SIZE;
        if body.len() > cap {
            return Err(ShoalError::Corruption {
                page_id: 0,
                detail: format!("meta body {} exceeds page capacity {}", body.len(), cap),
            });
        }
        page.data_mut()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + body.len()]
            .copy_from_slice(&body);

        // the meta page bypasses the buffer pool on purpose: it changes on
        // allocation and registry updates, both rare
        self.file
            .write_at(0, page.data())
            .map_err(|e| ShoalError::write_err(0, e))
    }

    fn read_meta(&self) -> ShoalResult<()> {
        let bytes = self.read_page(0)?;
        let page = Page::from_bytes(0, bytes)?;
        if &page.data()[..4] != PAGE_MAGIC || page.kind()? != PageKind::Meta {
            return Err(ShoalError::Corruption {
                page_id: 0,
                detail: "meta page missing file magic".to_string(),
            });
        }

        let mut reader = Cursor::new(&page.data()[PAGE_HEADER_SIZE..]);
        let stored_page_size = u32::decode_from(&mut reader)? as usize;
        if stored_page_size != self.page_size {
            return Err(ShoalError::Corruption {
                page_id: 0,
                detail: format!(
                    "file page size {} does not match configured {}",
                    stored_page_size, self.page_size
                ),
            });
        }
        let free_head = PageId::decode_from(&mut reader)?;
        let registry_len = u32::decode_from(&mut reader)? as usize;
        let registry = read_exact_buf(&mut reader, registry_len)?;

        *self.free_head.lock().unwrap() = free_head;
        *self.registry.lock().unwrap() = registry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn test_allocate_and_round_trip() {
        let f = temp_file();
        let file = PageFile::open(f.path(), 4096).unwrap();

        let pid = file.allocate_page().unwrap();
        assert_eq!(pid, 1);

        let mut page = Page::new_empty(pid, 4096, PageKind::Leaf);
        page.set_lsn(9);
        file.write_page(pid, page.data()).unwrap();
        file.sync().unwrap();

        let bytes = file.read_page(pid).unwrap();
        let loaded = Page::from_bytes(pid, bytes).unwrap();
        assert_eq!(loaded.kind().unwrap(), PageKind::Leaf);
        assert_eq!(loaded.lsn(), 9);
    }

    #[test]
    fn test_free_list_reuse() {
        let f = temp_file();
        let file = PageFile::open(f.path(), 4096).unwrap();

        let a = file.allocate_page().unwrap();
        let b = file.allocate_page().unwrap();
        assert_ne!(a, b);

        file.free_page(a).unwrap();
        let c = file.allocate_page().unwrap();
        assert_eq!(c, a);

        // free list drained, grow again
        let d = file.allocate_page().unwrap();
        assert_eq!(d, b + 1);
    }

    #[test]
    fn test_read_past_end() {
        let f = temp_file();
        let file = PageFile::open(f.path(), 4096).unwrap();
        assert!(matches!(file.read_page(99), Err(ShoalError::NotFound)));
    }

    #[test]
    fn test_partial_tail_rounded_down() {
        let f = temp_file();
        {
            let file = PageFile::open(f.path(), 4096).unwrap();
            file.allocate_page().unwrap();
        }
        // simulate a crash mid-growth
        let len = std::fs::metadata(f.path()).unwrap().len();
        let handle = std::fs::OpenOptions::new()
            .write(true)
            .open(f.path())
            .unwrap();
        handle.set_len(len + 100).unwrap();
        drop(handle);

        let file = PageFile::open(f.path(), 4096).unwrap();
        assert_eq!(file.page_count(), 2);
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let f = temp_file();
        let (a, b);
        {
            let file = PageFile::open(f.path(), 4096).unwrap();
            a = file.allocate_page().unwrap();
            b = file.allocate_page().unwrap();
            file.free_page(a).unwrap();
            file.sync().unwrap();
        }
        let file = PageFile::open(f.path(), 4096).unwrap();
        assert_eq!(file.allocate_page().unwrap(), a);
        assert_eq!(file.allocate_page().unwrap(), b + 1);
    }
}
