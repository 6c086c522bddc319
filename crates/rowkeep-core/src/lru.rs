//! Slot arena with an intrusive LRU list
//!
//! Values live in a `Vec` of slots addressed by index; freed slots are
//! reused. A slot can be linked into the recency list independently of
//! being allocated, so records still loading can hold a slot without
//! taking part in eviction.

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

#[derive(Debug)]
pub struct LruArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    linked: usize,
}

impl<T> Default for LruArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruArena<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            linked: 0,
        }
    }

    /// Store a value in an unlinked slot
    pub fn insert(&mut self, value: T) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx].value = Some(value);
            idx
        } else {
            self.slots.push(Slot {
                value: Some(value),
                prev: None,
                next: None,
                linked: false,
            });
            self.slots.len() - 1
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx).and_then(|s| s.value.as_mut())
    }

    /// Free a slot, unlinking it first
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.slots.get_mut(idx)?.value.take()?;
        self.unlink(idx);
        self.free.push(idx);
        Some(value)
    }

    /// Move a slot to the most recently used position
    pub fn touch(&mut self, idx: usize) {
        if self.get(idx).is_none() || self.head == Some(idx) {
            return;
        }
        self.unlink(idx);

        let slot = &mut self.slots[idx];
        slot.prev = None;
        slot.next = self.head;
        slot.linked = true;
        if let Some(head) = self.head {
            self.slots[head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.linked += 1;
    }

    pub fn unlink(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if !slot.linked {
            return;
        }
        let (prev, next) = (slot.prev.take(), slot.next.take());
        slot.linked = false;

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;
    }

    /// Least recently used linked slot
    #[must_use]
    pub const fn tail(&self) -> Option<usize> {
        self.tail
    }

    #[must_use]
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    /// Number of linked slots
    #[must_use]
    pub const fn linked_len(&self) -> usize {
        self.linked
    }

    /// Linked slots from most to least recently used
    pub fn iter_recent(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, |&idx| self.slots[idx].next)
    }
}
