//! Open-file registry: guards against conflicting opens and against
//! unlink/rename of objects that are still open.
//!
//! Entries are keyed by the containing directory's start cluster and
//! the byte offset of the short-name entry, so a key survives path
//! re-resolution of the same object. The counter holds the number of
//! shared readers, or [`EXCLUSIVE`] for a writer.

/// Counter value of a write-mode entry.
const EXCLUSIVE: u16 = 0x100;
/// Highest number of simultaneous readers of one object.
const MAX_READERS: u16 = 0xFF;
/// Table capacity per volume.
const CAPACITY: usize = 64;

#[derive(Copy, Clone, Default)]
struct Slot {
    dir_cluster: u32,
    dir_offset: u32,
    counter: u16,
}

pub(crate) struct Registry {
    slots: [Slot; CAPACITY],
}

impl Default for Registry {
    fn default() -> Self {
        Self { slots: [Slot::default(); CAPACITY] }
    }
}

/// Outcome of a registry probe or insertion attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Grant {
    /// Slot index to remember on the handle.
    Opened(usize),
    /// The object is open in a conflicting mode.
    Locked,
    /// No free slot remains.
    Full,
}

impl Registry {
    fn find(&self, dir_cluster: u32, dir_offset: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.counter != 0 && s.dir_cluster == dir_cluster && s.dir_offset == dir_offset)
    }

    /// True when the object may be unlinked or renamed: nothing holds
    /// it open.
    pub fn removable(&self, dir_cluster: u32, dir_offset: u32) -> bool {
        self.find(dir_cluster, dir_offset).is_none()
    }

    /// Probe whether an open would be granted, without inserting.
    /// Used before creation/truncation side effects happen.
    pub fn openable(&self, dir_cluster: u32, dir_offset: u32, write: bool) -> bool {
        match self.find(dir_cluster, dir_offset) {
            None => true,
            Some(index) => {
                let counter = self.slots[index].counter;
                !write && counter < EXCLUSIVE && counter < MAX_READERS
            }
        }
    }

    /// Register an open. A writer demands exclusivity; readers stack
    /// up to [`MAX_READERS`].
    pub fn open(&mut self, dir_cluster: u32, dir_offset: u32, write: bool) -> Grant {
        if let Some(index) = self.find(dir_cluster, dir_offset) {
            let slot = &mut self.slots[index];
            if write || slot.counter >= EXCLUSIVE || slot.counter == MAX_READERS {
                return Grant::Locked;
            }
            slot.counter += 1;
            return Grant::Opened(index);
        }
        match self.slots.iter().position(|s| s.counter == 0) {
            Some(index) => {
                self.slots[index] = Slot {
                    dir_cluster,
                    dir_offset,
                    counter: if write { EXCLUSIVE } else { 1 },
                };
                Grant::Opened(index)
            }
            None => Grant::Full,
        }
    }

    /// Drop one open reference held through `slot`.
    pub fn close(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        match entry.counter {
            0 => (),
            EXCLUSIVE => entry.counter = 0,
            _ => entry.counter -= 1,
        }
    }

    /// Forget every entry (volume unmount or remount).
    pub fn clear(&mut self) {
        self.slots = [Slot::default(); CAPACITY];
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writer_excludes_everyone() {
        let mut registry = Registry::default();
        let grant = registry.open(2, 64, true);
        let Grant::Opened(slot) = grant else { panic!("expected grant") };
        assert_eq!(registry.open(2, 64, false), Grant::Locked);
        assert_eq!(registry.open(2, 64, true), Grant::Locked);
        assert!(!registry.removable(2, 64));
        registry.close(slot);
        assert!(registry.removable(2, 64));
    }

    #[test]
    fn readers_stack() {
        let mut registry = Registry::default();
        let Grant::Opened(a) = registry.open(2, 0, false) else { panic!() };
        let Grant::Opened(b) = registry.open(2, 0, false) else { panic!() };
        assert_eq!(a, b);
        assert_eq!(registry.open(2, 0, true), Grant::Locked);
        registry.close(a);
        assert!(!registry.removable(2, 0));
        registry.close(b);
        assert!(registry.removable(2, 0));
    }

    #[test]
    fn distinct_objects_do_not_collide() {
        let mut registry = Registry::default();
        assert!(matches!(registry.open(2, 0, true), Grant::Opened(_)));
        assert!(matches!(registry.open(2, 32, true), Grant::Opened(_)));
        assert!(matches!(registry.open(3, 0, true), Grant::Opened(_)));
    }

    #[test]
    fn table_fills_up() {
        let mut registry = Registry::default();
        for i in 0..CAPACITY {
            assert!(matches!(registry.open(2, i as u32 * 32, false), Grant::Opened(_)));
        }
        assert_eq!(registry.open(2, 9999, false), Grant::Full);
    }
}
