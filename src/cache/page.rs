use std::fmt;

/// Identity of one cached page: the file it belongs to and the page-aligned
/// index within it. For page size `P`, the key covers the byte range
/// `[index * P, (index + 1) * P)` of the file.
///
/// File ids are opaque integers minted by the directory layer; the cache only
/// ever hashes and compares them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub id: u64,
    pub index: u64,
}

/// One page-aligned range of one file: a fixed-size buffer, a valid-prefix
/// length, and a dirty flag.
///
/// The length is the high-water mark of valid bytes. A page fetched short
/// (the end-of-file page) reads short rather than claiming device bytes that
/// were never fetched, and a page that has only ever been written claims no
/// bytes beyond the highest write. Bytes past the mark are zero.
///
/// A page is owned by exactly one place at a time: the LRU, the orphan sink,
/// or a local during transfer. It is never aliased.
pub struct Page {
    key: PageKey,
    data: Vec<u8>,
    len: usize,
    dirty: bool,
}

impl Page {
    /// An empty page backed by a zeroed buffer of `page_size` bytes.
    pub(crate) fn empty(key: PageKey, page_size: usize) -> Self {
        Self {
            key,
            data: vec![0; page_size],
            len: 0,
            dirty: false,
        }
    }

    /// A clean page holding `data` fetched from the device, padded out to
    /// `page_size`.
    ///
    /// # Panics
    ///
    /// Panics if the fetch returned more than a page.
    pub(crate) fn fetched(key: PageKey, mut data: Vec<u8>, page_size: usize) -> Self {
        assert!(data.len() <= page_size, "fetch returned more than a page");
        let len = data.len();
        data.resize(page_size, 0);
        Self {
            key,
            data,
            len,
            dirty: false,
        }
    }

    /// Copy up to `out.len()` valid bytes starting at `offset` into `out`,
    /// returning the number copied. Reading at or past the high-water mark
    /// yields no bytes.
    pub fn read(&self, out: &mut [u8], offset: usize) -> usize {
        let n = self.len.saturating_sub(offset).min(out.len());
        out[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    /// Copy all of `src` into the page at `offset`, extending the high-water
    /// mark if the write runs past it. The dirty flag is the caller's to set.
    ///
    /// # Panics
    ///
    /// Panics if the write would run off the end of the page.
    pub(crate) fn write(&mut self, src: &[u8], offset: usize) -> usize {
        let end = offset + src.len();
        assert!(end <= self.data.len(), "write past page bound");
        self.data[offset..end].copy_from_slice(src);
        self.len = self.len.max(end);
        src.len()
    }

    /// Number of valid bytes in the page.
    pub fn size(&self) -> usize {
        self.len
    }

    /// Whether the page holds writes not yet pushed to the device.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    /// The valid prefix of the page. This is what a flush snapshots and what
    /// orphan consumers push through the transport.
    pub fn contents(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("key", &self.key)
            .field("len", &self.len)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}
