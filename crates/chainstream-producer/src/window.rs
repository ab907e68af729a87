//! Reorg window: a fixed-capacity ring of the most recently delivered blocks.
//!
//! Capacity is `max_reorg_depth + 1`. Slots are preallocated and reused via
//! a write cursor that wraps around, so memory is bounded regardless of how
//! long the producer runs. Entries are always consecutive block numbers.

use chainstream_core::BlockRef;

pub struct ReorgWindow {
    slots: Vec<Option<BlockRef>>,
    /// Index the next entry is written to.
    cursor: usize,
    len: usize,
}

impl ReorgWindow {
    /// A window able to resolve forks up to `max_reorg_depth` blocks deep.
    pub fn new(max_reorg_depth: u64) -> Self {
        let capacity = (max_reorg_depth as usize).saturating_add(1);
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append the newest entry, evicting the oldest when full.
    pub fn push(&mut self, entry: BlockRef) {
        let cap = self.capacity();
        self.slots[self.cursor] = Some(entry);
        self.cursor = (self.cursor + 1) % cap;
        self.len = (self.len + 1).min(cap);
    }

    /// Most recently delivered entry.
    pub fn last(&self) -> Option<&BlockRef> {
        if self.len == 0 {
            return None;
        }
        let cap = self.capacity();
        self.slots[(self.cursor + cap - 1) % cap].as_ref()
    }

    /// Oldest retained entry.
    pub fn oldest(&self) -> Option<&BlockRef> {
        if self.len == 0 {
            return None;
        }
        let cap = self.capacity();
        self.slots[(self.cursor + cap - self.len) % cap].as_ref()
    }

    /// Entry for block `number`, if it is still retained.
    pub fn get(&self, number: u64) -> Option<&BlockRef> {
        let last = self.last()?;
        let back = last.number.checked_sub(number)?;
        if back >= self.len as u64 {
            return None;
        }
        let cap = self.capacity();
        let idx = (self.cursor + cap - 1 - back as usize) % cap;
        self.slots[idx].as_ref().filter(|e| e.number == number)
    }

    /// Drop every entry above `number`.
    pub fn truncate_after(&mut self, number: u64) {
        let cap = self.capacity();
        while self.last().is_some_and(|e| e.number > number) {
            self.cursor = (self.cursor + cap - 1) % cap;
            self.slots[self.cursor] = None;
            self.len -= 1;
        }
    }
}
