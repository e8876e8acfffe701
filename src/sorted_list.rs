//! Sorted list engine: many independent rank-ordered lists sharing one pool.
//!
//! Each list is a singly linked chain of entries kept in ascending key order.
//! Insertion walks past every entry whose key is `<=` the new key, so entries
//! with equal keys leave in insertion order. Popping the head is O(1).
//!
//! Entries live in one pool-wide arena addressed by `u32` index; popped or
//! deleted entries go onto a free list and are reused by later inserts, so
//! once the arena has grown to the working set no insert allocates.
//!
//! The pool performs no locking. All mutation goes through `&mut self`.

use crate::error::{ObjectKind, TmError, TmResult};
use serde::Serialize;

const NIL: u32 = u32::MAX;

/// Index of one list inside a [`SortedPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortedListId(u32);

impl SortedListId {
    pub const fn from_raw(raw: u32) -> Self {
        SortedListId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct ListDesc {
    head: u32,
    len: u32,
}

impl ListDesc {
    const EMPTY: ListDesc = ListDesc { head: NIL, len: 0 };
}

#[derive(Debug)]
struct Entry<T> {
    next: u32,
    key: u64,
    value: Option<T>,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SortedPoolStats {
    pub max_lists: u32,
    pub lists_created: u32,
    pub live_entries: u64,
    pub total_inserts: u64,
    pub total_removes: u64,
    pub total_deletes: u64,
}

#[derive(Debug)]
pub struct SortedPool<T> {
    descs: Vec<ListDesc>,
    next_list: u32,
    entries: Vec<Entry<T>>,
    free_head: u32,
    live_entries: u64,
    total_inserts: u64,
    total_removes: u64,
    total_deletes: u64,
}

impl<T> SortedPool<T> {
    /// Create a pool able to host `max_lists` lists. The descriptor table is
    /// allocated here; entries are allocated lazily.
    pub fn new(max_lists: u32) -> Self {
        Self {
            descs: vec![ListDesc::EMPTY; max_lists as usize],
            next_list: 0,
            entries: Vec::new(),
            free_head: NIL,
            live_entries: 0,
            total_inserts: 0,
            total_removes: 0,
            total_deletes: 0,
        }
    }

    /// Hand out the next list id.
    pub fn create_list(&mut self) -> TmResult<SortedListId> {
        if self.next_list as usize >= self.descs.len() {
            return Err(TmError::CapacityExceeded {
                kind: ObjectKind::SortedList,
                max: self.descs.len() as u64,
            });
        }
        let id = SortedListId(self.next_list);
        self.next_list += 1;
        Ok(id)
    }

    fn desc_index(&self, list: SortedListId) -> TmResult<usize> {
        if list.0 >= self.next_list {
            return Err(TmError::InvalidHandle {
                kind: ObjectKind::SortedList,
                id: list.0 as u64,
            });
        }
        Ok(list.0 as usize)
    }

    fn alloc_entry(&mut self, key: u64, value: T) -> u32 {
        if self.free_head != NIL {
            let index = self.free_head;
            let entry = &mut self.entries[index as usize];
            self.free_head = entry.next;
            entry.next = NIL;
            entry.key = key;
            entry.value = Some(value);
            index
        } else {
            self.entries.push(Entry {
                next: NIL,
                key,
                value: Some(value),
            });
            (self.entries.len() - 1) as u32
        }
    }

    fn release_entry(&mut self, index: u32) -> (u64, T) {
        let entry = &mut self.entries[index as usize];
        let value = entry
            .value
            .take()
            .expect("linked sorted-list entry must hold a value");
        let key = entry.key;
        entry.next = self.free_head;
        self.free_head = index;
        self.live_entries -= 1;
        (key, value)
    }

    /// Insert `value` with `key`, after every existing entry whose key is
    /// `<= key`.
    pub fn insert(&mut self, list: SortedListId, key: u64, value: T) -> TmResult<()> {
        let desc_index = self.desc_index(list)?;
        let new_index = self.alloc_entry(key, value);

        let mut prev = NIL;
        let mut cur = self.descs[desc_index].head;
        while cur != NIL && self.entries[cur as usize].key <= key {
            prev = cur;
            cur = self.entries[cur as usize].next;
        }

        self.entries[new_index as usize].next = cur;
        if prev == NIL {
            self.descs[desc_index].head = new_index;
        } else {
            self.entries[prev as usize].next = new_index;
        }

        self.descs[desc_index].len += 1;
        self.live_entries += 1;
        self.total_inserts += 1;
        Ok(())
    }

    /// Pop the entry with the smallest key (oldest among equal keys).
    pub fn remove(&mut self, list: SortedListId) -> TmResult<Option<(u64, T)>> {
        let desc_index = self.desc_index(list)?;
        let head = self.descs[desc_index].head;
        if head == NIL {
            return Ok(None);
        }

        let desc = &mut self.descs[desc_index];
        desc.head = self.entries[head as usize].next;
        desc.len -= 1;
        self.total_removes += 1;
        Ok(Some(self.release_entry(head)))
    }

    /// Smallest key and its value without removing it.
    pub fn peek(&self, list: SortedListId) -> TmResult<Option<(u64, &T)>> {
        let desc_index = self.desc_index(list)?;
        let head = self.descs[desc_index].head;
        if head == NIL {
            return Ok(None);
        }
        let entry = &self.entries[head as usize];
        Ok(entry.value.as_ref().map(|value| (entry.key, value)))
    }

    pub fn len(&self, list: SortedListId) -> TmResult<u32> {
        Ok(self.descs[self.desc_index(list)?].len)
    }

    pub fn is_empty(&self, list: SortedListId) -> TmResult<bool> {
        Ok(self.len(list)? == 0)
    }

    /// Walk the list in pop order.
    pub fn iter(&self, list: SortedListId) -> TmResult<Iter<'_, T>> {
        let desc_index = self.desc_index(list)?;
        Ok(Iter {
            pool: self,
            cur: self.descs[desc_index].head,
        })
    }

    /// Drop every entry of one list.
    pub fn clear(&mut self, list: SortedListId) -> TmResult<u32> {
        let desc_index = self.desc_index(list)?;
        let mut cur = self.descs[desc_index].head;
        let mut cleared = 0;
        while cur != NIL {
            let next = self.entries[cur as usize].next;
            self.release_entry(cur);
            cleared += 1;
            cur = next;
        }
        self.descs[desc_index] = ListDesc::EMPTY;
        self.total_deletes += cleared as u64;
        Ok(cleared)
    }

    pub fn stats(&self) -> SortedPoolStats {
        SortedPoolStats {
            max_lists: self.descs.len() as u32,
            lists_created: self.next_list,
            live_entries: self.live_entries,
            total_inserts: self.total_inserts,
            total_removes: self.total_removes,
            total_deletes: self.total_deletes,
        }
    }
}

impl<T: PartialEq> SortedPool<T> {
    /// Key of the first entry holding `value`, if any.
    pub fn find(&self, list: SortedListId, value: &T) -> TmResult<Option<u64>> {
        Ok(self
            .iter(list)?
            .find(|(_, candidate)| *candidate == value)
            .map(|(key, _)| key))
    }

    /// Unlink the first entry holding `value`. Returns whether one was found.
    pub fn delete(&mut self, list: SortedListId, value: &T) -> TmResult<bool> {
        let desc_index = self.desc_index(list)?;
        let mut prev = NIL;
        let mut cur = self.descs[desc_index].head;
        while cur != NIL {
            if self.entries[cur as usize].value.as_ref() == Some(value) {
                let next = self.entries[cur as usize].next;
                if prev == NIL {
                    self.descs[desc_index].head = next;
                } else {
                    self.entries[prev as usize].next = next;
                }
                self.descs[desc_index].len -= 1;
                self.total_deletes += 1;
                self.release_entry(cur);
                return Ok(true);
            }
            prev = cur;
            cur = self.entries[cur as usize].next;
        }
        Ok(false)
    }
}

/// Iterator over one list in pop order.
#[derive(Debug)]
pub struct Iter<'a, T> {
    pool: &'a SortedPool<T>,
    cur: u32,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let entry = &self.pool.entries[self.cur as usize];
        self.cur = entry.next;
        entry.value.as_ref().map(|value| (entry.key, value))
    }
}
