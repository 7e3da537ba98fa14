//! Fixed-capacity slot arena and a singly linked list built on it
//!
//! All memory is reserved up front; inserting and removing entries never
//! allocates, so the structures can be used from interrupt context.

use alloc::vec::Vec;

use crate::error::{HcdError, HcdResult};

/// Index of an arena slot plus the generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u16,
    generation: u16,
}

enum Slot<T> {
    Occupied { generation: u16, value: T },
    Vacant { generation: u16, next_free: Option<u16> },
}

pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u16>,
    len: usize,
}

impl<T> SlotArena<T> {
    pub fn with_capacity(capacity: usize) -> HcdResult<Self> {
        if capacity == 0 || capacity > u16::MAX as usize {
            return Err(HcdError::InvalidArgument {
                name: "capacity",
                value: "must be in 1..=65535",
            });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| HcdError::OutOfMemory {
                requested: capacity * core::mem::size_of::<Slot<T>>(),
            })?;
        for index in 0..capacity {
            let next_free = (index + 1 < capacity).then(|| (index + 1) as u16);
            slots.push(Slot::Vacant {
                generation: 0,
                next_free,
            });
        }

        Ok(Self {
            slots,
            free_head: Some(0),
            len: 0,
        })
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

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Store `value`, handing it back if every slot is taken
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        let Some(index) = self.free_head else {
            return Err(value);
        };
        let slot = &mut self.slots[index as usize];
        let (generation, next_free) = match *slot {
            Slot::Vacant {
                generation,
                next_free,
            } => (generation, next_free),
            Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
        };
        *slot = Slot::Occupied { generation, value };
        self.free_head = next_free;
        self.len += 1;
        Ok(Handle { index, generation })
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = core::mem::replace(slot, vacant) else {
            return None;
        };
        self.free_head = Some(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }
}

struct Link<T> {
    value: T,
    next: Option<Handle>,
}

/// Singly linked list whose nodes live in a [`SlotArena`]
pub struct HandleList<T> {
    arena: SlotArena<Link<T>>,
    head: Option<Handle>,
    tail: Option<Handle>,
}

impl<T> HandleList<T> {
    pub fn with_capacity(capacity: usize) -> HcdResult<Self> {
        Ok(Self {
            arena: SlotArena::with_capacity(capacity)?,
            head: None,
            tail: None,
        })
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn push_back(&mut self, value: T) -> Result<(), T> {
        let tail = self.tail;
        self.insert_after(tail, value)
    }

    /// Insert `value` before the first element for which `later` is true,
    /// or at the end
    pub fn insert_before(&mut self, value: T, mut later: impl FnMut(&T) -> bool) -> Result<(), T> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let Some(link) = self.arena.get(handle) else {
                break;
            };
            if later(&link.value) {
                break;
            }
            prev = Some(handle);
            cursor = link.next;
        }
        self.insert_after(prev, value)
    }

    fn insert_after(&mut self, prev: Option<Handle>, value: T) -> Result<(), T> {
        let handle = self
            .arena
            .insert(Link { value, next: None })
            .map_err(|link| link.value)?;

        let next = match prev {
            None => self.head.replace(handle),
            Some(prev) => match self.arena.get_mut(prev) {
                Some(link) => link.next.replace(handle),
                None => None,
            },
        };
        if let Some(link) = self.arena.get_mut(handle) {
            link.next = next;
        }
        if next.is_none() {
            self.tail = Some(handle);
        }
        Ok(())
    }

    pub fn front(&self) -> Option<&T> {
        self.arena.get(self.head?).map(|link| &link.value)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        let link = self.arena.remove(head)?;
        self.head = link.next;
        if self.head.is_none() {
            self.tail = None;
        }
        Some(link.value)
    }

    /// Unlink every element matching `remove` and return them in list order
    pub fn drain_matching(&mut self, mut remove: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut prev: Option<Handle> = None;
        let mut cursor = self.head;

        while let Some(handle) = cursor {
            let Some(link) = self.arena.get(handle) else {
                break;
            };
            let next = link.next;

            if remove(&link.value) {
                match prev {
                    None => self.head = next,
                    Some(prev) => {
                        if let Some(prev_link) = self.arena.get_mut(prev) {
                            prev_link.next = next;
                        }
                    }
                }
                if next.is_none() {
                    self.tail = prev;
                }
                if let Some(link) = self.arena.remove(handle) {
                    removed.push(link.value);
                }
            } else {
                prev = Some(handle);
            }
            cursor = next;
        }

        removed
    }

    /// Visit elements in list order
    pub fn for_each(&self, mut visit: impl FnMut(&T)) {
        let mut cursor = self.head;
        while let Some(link) = cursor.and_then(|handle| self.arena.get(handle)) {
            visit(&link.value);
            cursor = link.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn collect(list: &HandleList<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        list.for_each(|v| out.push(*v));
        out
    }

    #[test]
    fn test_arena_reuses_slots_with_new_generation() {
        let mut arena = SlotArena::with_capacity(2).unwrap();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert!(arena.is_full());
        assert_eq!(arena.insert("c"), Err("c"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);
        let c = arena.insert("c").unwrap();
        assert_ne!(a, c);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_arena_capacity_limits() {
        assert!(SlotArena::<u8>::with_capacity(0).is_err());
        assert!(SlotArena::<u8>::with_capacity(70_000).is_err());
    }

    #[test]
    fn test_list_ordering() {
        let mut list = HandleList::with_capacity(8).unwrap();
        list.push_back(1).unwrap();
        list.push_back(5).unwrap();
        list.insert_before(3, |v| *v > 3).unwrap();
        list.insert_before(9, |v| *v > 9).unwrap();
        list.insert_before(0, |v| *v > 0).unwrap();
        assert_eq!(collect(&list), vec![0, 1, 3, 5, 9]);

        // Tail must follow the last insertion at the end
        list.push_back(10).unwrap();
        assert_eq!(collect(&list), vec![0, 1, 3, 5, 9, 10]);
        assert_eq!(list.pop_front(), Some(0));
        assert_eq!(list.front(), Some(&1));
    }

    #[test]
    fn test_drain_matching_keeps_links() {
        let mut list = HandleList::with_capacity(8).unwrap();
        for v in 1..=6 {
            list.push_back(v).unwrap();
        }
        let removed = list.drain_matching(|v| v % 2 == 0);
        assert_eq!(removed, vec![2, 4, 6]);
        assert_eq!(collect(&list), vec![1, 3, 5]);
        // Tail is 5 now
        list.push_back(7).unwrap();
        assert_eq!(collect(&list), vec![1, 3, 5, 7]);
        assert_eq!(list.len(), 4);

        let removed = list.drain_matching(|_| true);
        assert_eq!(removed.len(), 4);
        assert!(list.is_empty());
        list.push_back(8).unwrap();
        assert_eq!(collect(&list), vec![8]);
    }

    #[test]
    fn test_full_list_returns_value() {
        let mut list = HandleList::with_capacity(1).unwrap();
        list.push_back(1).unwrap();
        assert_eq!(list.push_back(2), Err(2));
        assert_eq!(list.insert_before(3, |_| true), Err(3));
        assert_eq!(list.len(), 1);
    }
}
