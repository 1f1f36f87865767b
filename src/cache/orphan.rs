use super::page::{Page, PageKey};

/// Holding area for dirty pages evicted before they could be flushed.
///
/// Eviction never writes to the device: the transport's tail latency would
/// stall whichever read or write triggered the eviction. A dirty victim
/// parks here instead, until the host drains it with [Self::take_all] or the
/// key becomes resident again and the page is pulled back into the LRU.
///
/// The sink is expected to stay small (hosts drain it on a short schedule),
/// so keyed removal scans.
pub(super) struct OrphanSink {
    pages: Vec<Page>,
}

impl OrphanSink {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Park an evicted dirty page.
    pub fn push(&mut self, page: Page) {
        debug_assert!(page.is_dirty(), "clean page in orphan sink");
        debug_assert!(
            self.pages.iter().all(|parked| parked.key() != page.key()),
            "duplicate orphan"
        );
        self.pages.push(page);
    }

    /// Pull the page for `key` back out, if parked. Keeps the sink free of
    /// entries for keys that regain residency.
    pub fn remove(&mut self, key: &PageKey) -> Option<Page> {
        let at = self.pages.iter().position(|page| page.key() == *key)?;
        Some(self.pages.swap_remove(at))
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.pages.iter().any(|page| page.key() == *key)
    }

    /// Transfer every parked page out, leaving the sink empty.
    pub fn take_all(&mut self) -> Vec<Page> {
        std::mem::take(&mut self.pages)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}
