use super::Env;
use crate::{Error, Result};

/// A hook run when its environment is torn down.
pub type CleanupHook = fn(&Env, usize);

struct Entry {
    hook: CleanupHook,
    arg: usize,
}

impl Entry {
    fn matches(&self, hook: CleanupHook, arg: usize) -> bool {
        self.hook as usize == hook as usize && self.arg == arg
    }
}

/// Registered cleanup hooks in registration order.
#[derive(Default)]
pub(crate) struct CleanupQueue {
    entries: Vec<Entry>,
}

impl CleanupQueue {
    pub(crate) fn add(&mut self, hook: CleanupHook, arg: usize) -> Result<()> {
        if self.entries.iter().any(|e| e.matches(hook, arg)) {
            return Err(Error::invalid_arg("cleanup hook is already registered"));
        }
        self.entries.push(Entry { hook, arg });
        Ok(())
    }

    pub(crate) fn remove(&mut self, hook: CleanupHook, arg: usize) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.matches(hook, arg))
            .ok_or_else(|| Error::invalid_arg("cleanup hook is not registered"))?;
        self.entries.remove(pos);
        Ok(())
    }

    /// The most recently registered hook.
    pub(crate) fn pop_newest(&mut self) -> Option<(CleanupHook, usize)> {
        self.entries.pop().map(|e| (e.hook, e.arg))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_: &Env, _: usize) {}
    fn second(_: &Env, _: usize) {}

    #[test]
    fn duplicates_are_rejected_per_argument() {
        let mut queue = CleanupQueue::default();
        queue.add(first, 1).unwrap();
        assert!(queue.add(first, 1).is_err());
        queue.add(first, 2).unwrap();
        queue.add(second, 1).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn drains_newest_first() {
        let mut queue = CleanupQueue::default();
        queue.add(first, 1).unwrap();
        queue.add(second, 2).unwrap();
        queue.add(first, 3).unwrap();
        queue.remove(second, 2).unwrap();
        assert!(queue.remove(second, 2).is_err());
        let order: Vec<usize> = std::iter::from_fn(|| queue.pop_newest().map(|(_, a)| a)).collect();
        assert_eq!(order, vec![3, 1]);
    }
}
