//! Open-addressed hash table keyed by 32-bit blob IDs.
//!
//! Linear probing with step 1 and Knuth's multiplicative hash into a
//! power-of-two table. A separate implementation rather than a stock map
//! because the keys are integers and because the table must never
//! reallocate: it is sized once, at 4x the expected number of live
//! subscriptions, and lives under the cache lock for its whole life.
//!
//! Deletion back-shifts the probe chain: after a slot empties, every
//! following entry whose home position lies at or before the hole moves
//! up, so no chain is ever broken.

/// Knuth: 2^32 * (sqrt(5)-1)/2.
const GOLDEN: u32 = 2654435769;

/// Table capacity bounds, as log2. Huge and extremely small tables are
/// not supported.
pub(crate) const LD_MIN: u32 = 3;
pub(crate) const LD_MAX: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableError {
    Full,
    KeyExists,
    KeyNotFound,
    TooLarge,
}

struct Entry<V> {
    key: u32,
    val: V,
}

pub(crate) struct IdTable<V> {
    slots: Box<[Option<Entry<V>>]>,
    ldsz: u32,
    len: usize,
}

impl<V> IdTable<V> {
    /// Create a table able to hold `capacity_hint` entries, rounded up to
    /// a power of two within the supported bounds.
    pub fn with_capacity(capacity_hint: usize) -> Result<IdTable<V>, TableError> {
        let ld = capacity_hint.next_power_of_two().trailing_zeros().max(LD_MIN);
        if ld > LD_MAX {
            return Err(TableError::TooLarge);
        }
        let cap = 1usize << ld;
        Ok(IdTable {
            slots: (0..cap).map(|_| None).collect(),
            ldsz: ld,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn hash(&self, key: u32) -> usize {
        (key.wrapping_mul(GOLDEN) >> (32 - self.ldsz)) as usize
    }

    /// Walk the probe chain for `key`: the slot holding it, or the first
    /// empty slot, or nothing if the table is completely full.
    fn probe(&self, key: u32) -> Option<(usize, bool)> {
        let start = self.hash(key);
        for i in 0..self.slots.len() {
            let idx = (start + i) & self.mask();
            match &self.slots[idx] {
                None => return Some((idx, false)),
                Some(e) if e.key == key => return Some((idx, true)),
                Some(_) => {}
            }
        }
        None
    }

    pub fn find(&self, key: u32) -> Option<&V> {
        match self.probe(key) {
            Some((idx, true)) => self.slots[idx].as_ref().map(|e| &e.val),
            _ => None,
        }
    }

    /// Insert a new entry. The key must not be present.
    pub fn add(&mut self, key: u32, val: V) -> Result<(), TableError> {
        match self.probe(key) {
            Some((_, true)) => Err(TableError::KeyExists),
            Some((idx, false)) => {
                self.slots[idx] = Some(Entry { key, val });
                self.len += 1;
                Ok(())
            }
            None => Err(TableError::Full),
        }
    }

    /// Remove `key`, back-shifting the probe chain behind it.
    pub fn remove(&mut self, key: u32) -> Result<V, TableError> {
        let hole = match self.probe(key) {
            Some((idx, true)) => idx,
            _ => return Err(TableError::KeyNotFound),
        };
        let entry = self.slots[hole].take();
        self.len -= 1;

        let mask = self.mask();
        let mut hole = hole;
        let mut idx = (hole + 1) & mask;
        while let Some(e) = &self.slots[idx] {
            let home = self.hash(e.key);
            // movable iff its home position is not inside (hole, idx]
            if (idx.wrapping_sub(home) & mask) >= (idx.wrapping_sub(hole) & mask) {
                self.slots[hole] = self.slots[idx].take();
                hole = idx;
            }
            idx = (idx + 1) & mask;
        }

        Ok(entry.map(|e| e.val).expect("probe found the key"))
    }

    /// Empty the table, handing back every entry. Used at teardown.
    pub fn drain_entries(&mut self) -> Vec<(u32, V)> {
        self.len = 0;
        self.slots
            .iter_mut()
            .filter_map(|s| s.take().map(|e| (e.key, e.val)))
            .collect()
    }
}
