//! Value Cell
//!
//! The single slot that caches the most recently published value.
//!
//! The "is set" flag and the value live together in one `Option<T>` behind a
//! reader/writer lock, so a reader can never observe the flag without the
//! value it describes. An unset cell has no value at all rather than a
//! placeholder that could be surfaced by mistake.

use parking_lot::RwLock;

/// Holds at most one current value.
pub(crate) struct ValueCell<T> {
    slot: RwLock<Option<T>>,
}

impl<T: Clone> ValueCell<T> {
    /// Create a cell, optionally pre-populated.
    pub(crate) fn new(initial: Option<T>) -> Self {
        Self {
            slot: RwLock::new(initial),
        }
    }

    /// Replace the current value.
    pub(crate) fn set(&self, value: T) {
        *self.slot.write() = Some(value);
    }

    /// Snapshot of the current value, `None` if nothing was ever set.
    pub(crate) fn get(&self) -> Option<T> {
        self.slot.read().clone()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_cell_has_no_value() {
        let cell: ValueCell<i32> = ValueCell::new(None);
        assert!(!cell.is_set());
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn initial_value_is_visible() {
        let cell = ValueCell::new(Some("ready"));
        assert!(cell.is_set());
        assert_eq!(cell.get(), Some("ready"));
    }

    #[test]
    fn set_replaces_value() {
        let cell = ValueCell::new(None);
        cell.set(1);
        cell.set(2);
        assert_eq!(cell.get(), Some(2));
    }

    #[test]
    fn concurrent_readers_never_see_torn_pairs() {
        // Each written pair holds the same number twice.
        let cell = Arc::new(ValueCell::new(Some((0u64, 0u64))));

        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for i in 1..10_000u64 {
                    cell.set((i, i));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let (a, b) = cell.get().unwrap();
                        assert_eq!(a, b);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cell.get(), Some((9_999, 9_999)));
    }
}
