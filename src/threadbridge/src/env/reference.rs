//! References: manually counted holds on values, kept in a generational arena.

use super::Env;
use super::value::{Value, WeakObject};

/// Callback run once when a referenced value is finalized.
pub type FinalizeCallback = Box<dyn FnOnce(&Env)>;

/// Identity of a reference. Stale ids are detected by their generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId {
    index: u32,
    generation: u32,
}

/// Who deletes the reference once its finalizer has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The runtime deletes it after finalization.
    Runtime,
    /// The embedder deletes it with `delete_reference`.
    Userland,
}

pub(crate) enum Persistent {
    Strong(Value),
    Weak(WeakObject),
    Empty,
}

impl Persistent {
    pub(crate) fn value(&self) -> Option<Value> {
        match self {
            Persistent::Strong(v) => Some(v.clone()),
            Persistent::Weak(w) => w.upgrade().map(Value::Object),
            Persistent::Empty => None,
        }
    }

    /// Whether the value is gone, either collected or dropped.
    pub(crate) fn is_released(&self) -> bool {
        match self {
            Persistent::Strong(_) => false,
            Persistent::Weak(w) => w.is_collected(),
            Persistent::Empty => true,
        }
    }
}

pub(crate) struct Reference {
    pub(crate) persistent: Persistent,
    pub(crate) refcount: u32,
    pub(crate) ownership: Ownership,
    pub(crate) finalizer: Option<FinalizeCallback>,
    // creation order, used to finalize newest first
    pub(crate) seq: u64,
}

struct Slot {
    generation: u32,
    entry: Option<Reference>,
}

/// Generational arena with a free list.
pub(crate) struct RefArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
}

impl RefArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, mut reference: Reference) -> RefId {
        reference.seq = self.next_seq;
        self.next_seq += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(reference);
                RefId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(reference),
                });
                RefId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: RefId) -> Option<&Reference> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: RefId) -> Option<&mut Reference> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn remove(&mut self, id: RefId) -> Option<Reference> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Live ids, newest first. `finalizing` selects references that still
    /// carry a finalizer, otherwise those that do not.
    pub(crate) fn newest_first(&self, finalizing: bool) -> Vec<RefId> {
        let mut live: Vec<(u64, RefId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                (entry.finalizer.is_some() == finalizing).then_some((
                    entry.seq,
                    RefId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                ))
            })
            .collect();
        live.sort_by(|a, b| b.0.cmp(&a.0));
        live.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(finalizer: bool) -> Reference {
        Reference {
            persistent: Persistent::Strong(Value::Number(1.0)),
            refcount: 1,
            ownership: Ownership::Userland,
            finalizer: finalizer.then(|| Box::new(|_: &Env| {}) as FinalizeCallback),
            seq: 0,
        }
    }

    #[test]
    fn stale_ids_are_rejected_after_reuse() {
        let mut arena = RefArena::new();
        let first = arena.insert(reference(false));
        assert!(arena.remove(first).is_some());
        let second = arena.insert(reference(false));
        assert_eq!(first.index, second.index);
        assert!(arena.get(first).is_none());
        assert!(arena.remove(first).is_none());
        assert!(arena.get(second).is_some());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn newest_first_splits_by_finalizer() {
        let mut arena = RefArena::new();
        let a = arena.insert(reference(true));
        let b = arena.insert(reference(false));
        let c = arena.insert(reference(true));
        assert_eq!(arena.newest_first(true), vec![c, a]);
        assert_eq!(arena.newest_first(false), vec![b]);
    }
}
