//! Generational slab holding reactor handlers.
//!
//! A key stays valid until its slot is freed. Freeing bumps the slot's
//! generation, so keys captured by timers or closures outlive their handler
//! safely: every lookup through a stale key misses.

/// Generation-checked index into a [`Slab`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabKey {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for SlabKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Occupied slot.
struct Node<T> {
    /// Payload; `None` while lent out through [`Slab::take`].
    payload: Option<T>,
    generation: u32,
}

/// Metadata for a free slot.
struct FreeSlot {
    next: Option<u32>,
    generation: u32,
}

enum Entry<T> {
    Occupied(Node<T>),
    Free(FreeSlot),
}

/// Growable slab with an intrusive free list.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    /// Creates an empty slab.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots, lent out or not.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its key.
    pub fn insert(&mut self, value: T) -> SlabKey {
        self.occupy(Some(value))
    }

    /// Occupies a slot without a payload. The slot behaves as if lent out
    /// until [`restore`](Self::restore) fills it.
    pub fn reserve(&mut self) -> SlabKey {
        self.occupy(None)
    }

    fn occupy(&mut self, payload: Option<T>) -> SlabKey {
        self.len += 1;

        if let Some(head) = self.free_head {
            let idx = head as usize;
            let (next_free, generation) = match &self.entries[idx] {
                Entry::Free(slot) => (slot.next, slot.generation),
                Entry::Occupied(_) => unreachable!("free_head must point to free slot"),
            };
            self.free_head = next_free;
            self.entries[idx] = Entry::Occupied(Node {
                payload,
                generation,
            });
            return SlabKey {
                index: head,
                generation,
            };
        }

        let index = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        assert!(index < u32::MAX, "slab exceeds u32::MAX entries");
        self.entries.push(Entry::Occupied(Node {
            payload,
            generation: 0,
        }));
        SlabKey {
            index,
            generation: 0,
        }
    }

    /// Frees the slot behind `key`. Returns the payload if it was present;
    /// `None` if the key is stale or the payload is lent out.
    pub fn remove(&mut self, key: SlabKey) -> Option<T> {
        let node = self.node_mut(key)?;
        let payload = node.payload.take();
        let generation = node.generation;

        self.entries[key.index as usize] = Entry::Free(FreeSlot {
            next: self.free_head,
            generation: generation.wrapping_add(1),
        });
        self.free_head = Some(key.index);
        self.len -= 1;
        payload
    }

    /// Returns `true` if `key` refers to an occupied slot.
    #[must_use]
    pub fn contains(&self, key: SlabKey) -> bool {
        self.node(key).is_some()
    }

    /// Lends out the payload behind `key`, leaving the slot occupied.
    pub fn take(&mut self, key: SlabKey) -> Option<T> {
        self.node_mut(key)?.payload.take()
    }

    /// Returns a lent-out payload. Hands `value` back if the slot was freed
    /// in the meantime.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when `key` is stale.
    pub fn restore(&mut self, key: SlabKey, value: T) -> Result<(), T> {
        match self.node_mut(key) {
            Some(node) => {
                debug_assert!(node.payload.is_none(), "restore over a present payload");
                node.payload = Some(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Gets a mutable reference to the payload, if present.
    pub fn get_mut(&mut self, key: SlabKey) -> Option<&mut T> {
        self.node_mut(key)?.payload.as_mut()
    }

    /// Keys of all occupied slots.
    #[must_use]
    pub fn keys(&self) -> Vec<SlabKey> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Occupied(node) => Some(SlabKey {
                    index: i as u32,
                    generation: node.generation,
                }),
                Entry::Free(_) => None,
            })
            .collect()
    }

    /// Removes every payload, leaving the slab empty.
    pub fn drain(&mut self) -> Vec<T> {
        let out = self
            .entries
            .drain(..)
            .filter_map(|entry| match entry {
                Entry::Occupied(node) => node.payload,
                Entry::Free(_) => None,
            })
            .collect();
        self.free_head = None;
        self.len = 0;
        out
    }

    fn node(&self, key: SlabKey) -> Option<&Node<T>> {
        match self.entries.get(key.index as usize)? {
            Entry::Occupied(n) if n.generation == key.generation => Some(n),
            _ => None,
        }
    }

    fn node_mut(&mut self, key: SlabKey) -> Option<&mut Node<T>> {
        match self.entries.get_mut(key.index as usize)? {
            Entry::Occupied(n) if n.generation == key.generation => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");

        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get_mut(a), Some(&mut "a"));
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.get_mut(a), None);
        assert_eq!(slab.get_mut(b), Some(&mut "b"));
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn reused_slot_rejects_stale_key() {
        let mut slab = Slab::new();
        let old = slab.insert(1);
        slab.remove(old);

        let new = slab.insert(2);
        assert_ne!(old, new);
        assert!(!slab.contains(old));
        assert_eq!(slab.remove(old), None);
        assert_eq!(slab.get_mut(new), Some(&mut 2));
    }

    #[test]
    fn take_and_restore() {
        let mut slab = Slab::new();
        let key = slab.insert(String::from("h"));

        let value = slab.take(key).unwrap();
        assert!(slab.contains(key));
        assert_eq!(slab.take(key), None);

        slab.restore(key, value).unwrap();
        assert_eq!(slab.get_mut(key).map(|s| s.as_str()), Some("h"));
    }

    #[test]
    fn restore_after_remove_hands_value_back() {
        let mut slab = Slab::new();
        let key = slab.insert(7);
        let value = slab.take(key).unwrap();

        assert_eq!(slab.remove(key), None);
        assert_eq!(slab.restore(key, value), Err(7));
        assert!(slab.is_empty());
    }

    #[test]
    fn reserve_then_fill() {
        let mut slab = Slab::new();
        let key = slab.reserve();
        assert!(slab.contains(key));
        assert_eq!(slab.get_mut(key), None);

        slab.restore(key, 3).unwrap();
        assert_eq!(slab.keys(), vec![key]);
        assert_eq!(slab.drain(), vec![3]);
        assert!(slab.is_empty());
    }
}
