use super::page::{Page, PageKey};
use std::collections::HashMap;

/// Sentinel slot index for "no neighbor".
const NIL: usize = usize::MAX;

/// Stable reference to a resident page. Valid from insertion until that
/// page's removal or eviction; in particular, never hold one across a
/// suspension point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Handle(usize);

struct Slot {
    page: Option<Page>,
    prev: usize,
    next: usize,
}

/// The residency index: an arena of slots threaded into a doubly-linked
/// recency list (front = most recently touched), with a side map for O(1)
/// lookup by key. Freed slots are recycled through a free list, so the arena
/// never shifts pages and handles stay cheap plain indices.
pub(super) struct LruIndex {
    slots: Vec<Slot>,
    index: HashMap<PageKey, usize>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
}

impl LruIndex {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            free: Vec::new(),
        }
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &PageKey) -> Option<Handle> {
        self.index.get(key).copied().map(Handle)
    }

    pub fn page(&self, handle: Handle) -> &Page {
        self.slots[handle.0].page.as_ref().expect("stale handle")
    }

    pub fn page_mut(&mut self, handle: Handle) -> &mut Page {
        self.slots[handle.0].page.as_mut().expect("stale handle")
    }

    /// Install a page at the front of the recency list.
    ///
    /// # Panics
    ///
    /// Panics if the page's key is already resident.
    pub fn insert_front(&mut self, page: Page) -> Handle {
        let key = page.key();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].page = Some(page);
                slot
            }
            None => {
                self.slots.push(Slot {
                    page: Some(page),
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        let prev = self.index.insert(key, slot);
        assert!(prev.is_none(), "key already resident");
        self.link_front(slot);
        Handle(slot)
    }

    /// Move a page to the front of the recency list.
    pub fn touch(&mut self, handle: Handle) {
        if self.head == handle.0 {
            return;
        }
        self.unlink(handle.0);
        self.link_front(handle.0);
    }

    /// Remove and return the least recently used page.
    pub fn pop_back(&mut self) -> Option<Page> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        let page = self.slots[slot].page.take().expect("tail slot empty");
        self.index.remove(&page.key());
        self.free.push(slot);
        Some(page)
    }

    /// Remove and return the page for `key`, if resident.
    pub fn remove(&mut self, key: &PageKey) -> Option<Page> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        let page = self.slots[slot].page.take().expect("indexed slot empty");
        self.free.push(slot);
        Some(page)
    }

    /// Drop every resident page.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn link_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Slot { prev, next, .. } = self.slots[slot];
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: u64) -> PageKey {
        PageKey { id: 1, index }
    }

    fn page(index: u64) -> Page {
        Page::empty(key(index), 16)
    }

    #[test]
    fn test_insert_get_touch_pop() {
        let mut lru = LruIndex::new();
        assert_eq!(lru.len(), 0);
        assert!(lru.pop_back().is_none());

        for index in 0..4 {
            lru.insert_front(page(index));
        }
        assert_eq!(lru.len(), 4);

        // Touch the oldest page; the next-oldest becomes the victim.
        let handle = lru.get(&key(0)).unwrap();
        lru.touch(handle);
        assert_eq!(lru.pop_back().unwrap().key(), key(1));
        assert_eq!(lru.pop_back().unwrap().key(), key(2));
        assert_eq!(lru.pop_back().unwrap().key(), key(3));
        assert_eq!(lru.pop_back().unwrap().key(), key(0));
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn test_handles_survive_unrelated_churn() {
        let mut lru = LruIndex::new();
        let handle = lru.insert_front(page(0));
        for index in 1..8 {
            lru.insert_front(page(index));
            lru.pop_back();
        }
        // Key 0 was evicted by the first pop; its slot was recycled. The
        // surviving resident is key 7 and its handle still resolves.
        assert!(lru.get(&key(0)).is_none());
        let handle7 = lru.get(&key(7)).unwrap();
        assert_eq!(lru.page(handle7).key(), key(7));
        // The original handle's slot now hosts a different page; handles must
        // only be trusted between lookup and the next mutation.
        let _ = handle;
    }

    #[test]
    fn test_slot_recycling_keeps_arena_compact() {
        let mut lru = LruIndex::new();
        for round in 0..10u64 {
            lru.insert_front(page(round));
            let victim = lru.pop_back().unwrap();
            assert_eq!(victim.key(), key(round));
        }
        // One slot serviced all ten rounds.
        assert_eq!(lru.slots.len(), 1);
    }

    #[test]
    fn test_remove_by_key() {
        let mut lru = LruIndex::new();
        for index in 0..4 {
            lru.insert_front(page(index));
        }

        // Middle, then head, then tail of the recency list.
        assert_eq!(lru.remove(&key(2)).unwrap().key(), key(2));
        assert_eq!(lru.remove(&key(3)).unwrap().key(), key(3));
        assert_eq!(lru.remove(&key(0)).unwrap().key(), key(0));
        assert!(lru.remove(&key(0)).is_none());
        assert_eq!(lru.len(), 1);
        assert!(lru.get(&key(2)).is_none());

        // Freed slots are recycled and the survivors stay linked.
        lru.insert_front(page(7));
        assert_eq!(lru.pop_back().unwrap().key(), key(1));
        assert_eq!(lru.pop_back().unwrap().key(), key(7));
        assert!(lru.is_empty());
        assert_eq!(lru.slots.len(), 4);
    }

    #[test]
    fn test_is_empty_tracks_residency() {
        let mut lru = LruIndex::new();
        assert!(lru.is_empty());
        lru.insert_front(page(0));
        assert!(!lru.is_empty());
        lru.pop_back();
        assert!(lru.is_empty());
    }

    #[test]
    fn test_touch_front_is_a_no_op() {
        let mut lru = LruIndex::new();
        lru.insert_front(page(0));
        let handle = lru.insert_front(page(1));
        lru.touch(handle);
        lru.touch(handle);
        assert_eq!(lru.pop_back().unwrap().key(), key(0));
    }

    #[test]
    fn test_clear() {
        let mut lru = LruIndex::new();
        for index in 0..3 {
            lru.insert_front(page(index));
        }
        lru.clear();
        assert_eq!(lru.len(), 0);
        assert!(lru.get(&key(0)).is_none());
        assert!(lru.pop_back().is_none());
    }

    #[test]
    #[should_panic(expected = "key already resident")]
    fn test_duplicate_insert_panics() {
        let mut lru = LruIndex::new();
        lru.insert_front(page(0));
        lru.insert_front(page(0));
    }
}
