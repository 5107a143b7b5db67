//! Open-addressed hash table over a single ledger-tracked allocation.
//!
//! Slots live contiguously in one [`Allocation`]; there is no per-entry heap
//! allocation. Each slot carries a state byte (`Empty`, `Occupied` or
//! `Tombstone`) next to its key and value.
//!
//! # Probing
//!
//! Every operation probes linearly from the top `log2(slots)` bits of
//! `fxhash(key)`:
//!
//! - Lookup stops at an `Empty` slot or a matching key. It walks over
//!   tombstones, since the key may sit further along the chain.
//! - Insertion remembers the first tombstone as a candidate but keeps going
//!   until `Empty` or a match, so an existing key is never duplicated.
//! - Removal writes a tombstone. Turning the slot back to `Empty` would cut
//!   the chain of any key that probed past it.
//!
//! The table grows once live entries plus tombstones would exceed three
//! quarters of the slots. Growth reinserts only occupied slots into a fresh
//! power-of-two allocation and drops every tombstone.

use crate::alloc::{Allocation, natural_alignment};
use crate::config::{DEFAULT_TABLE_SLOTS, LOAD_FACTOR_DEN, LOAD_FACTOR_NUM};
use crate::error::{Error, Result};
use rawmem_log::debug;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};

/// Occupancy marker. `Empty` must stay zero so a zeroed block is an empty table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty = 0,
    Occupied = 1,
    Tombstone = 2,
}

#[repr(C)]
struct Slot<K, V> {
    state: SlotState,
    key: MaybeUninit<K>,
    value: MaybeUninit<V>,
}

enum Probe {
    /// The key lives in this slot.
    Found(usize),
    /// The key is absent; this is where it would go.
    Vacant(usize),
    /// The key is absent and no slot is free.
    Full,
}

/// A fixed-size-key to fixed-size-value map with tombstone deletion.
pub struct HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    block: Allocation,
    slot_count: usize,
    len: usize,
    tombstones: usize,
    generation: u64,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: the table owns its keys and values exclusively.
unsafe impl<K: Copy + Eq + Hash + Send, V: Copy + Send> Send for HashTable<K, V> {}
// SAFETY: shared access only reads.
unsafe impl<K: Copy + Eq + Hash + Sync, V: Copy + Sync> Sync for HashTable<K, V> {}

/// First slot probed for `key` in a table of `slot_count` slots.
///
/// FxHash multiplies, so its low bits repeat for keys that share low bits
/// (addresses, strided ids). The index comes from the top bits instead.
#[inline]
fn home_slot<K: Hash>(key: &K, slot_count: usize) -> usize {
    let bits = slot_count.trailing_zeros();
    if bits == 0 {
        return 0;
    }
    (fxhash::hash64(key) >> (u64::BITS - bits)) as usize
}

#[track_caller]
fn allocate_slots<K, V>(slot_count: usize) -> Allocation {
    let Some(bytes) = slot_count.checked_mul(mem::size_of::<Slot<K, V>>()) else {
        panic!("{}", Error::InvalidCapacity { requested: slot_count });
    };
    let align = mem::align_of::<Slot<K, V>>().max(natural_alignment(bytes));
    Allocation::with_alignment(bytes, align)
}

impl<K, V> HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Creates an empty table with the default slot count.
    #[track_caller]
    #[must_use]
    pub fn new() -> Self {
        HashTable::with_capacity(DEFAULT_TABLE_SLOTS)
    }

    /// Creates an empty table with `slots` slots, rounded up to a power of
    /// two (minimum 1).
    ///
    /// # Panics
    ///
    /// Panics if the slot array size overflows.
    #[track_caller]
    #[must_use]
    pub fn with_capacity(slots: usize) -> Self {
        let Some(slot_count) = slots.max(1).checked_next_power_of_two() else {
            panic!("{}", Error::InvalidCapacity { requested: slots });
        };

        HashTable {
            block: allocate_slots::<K, V>(slot_count),
            slot_count,
            len: 0,
            tombstones: 0,
            generation: 0,
            _marker: PhantomData,
        }
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when the table has no live entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Number of tombstoned slots awaiting the next rehash.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Number of times the slot array has been rebuilt.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[track_caller]
    fn slots(&self) -> &[Slot<K, V>] {
        self.block.assert_live();
        // SAFETY: the block holds `slot_count` slots, aligned for `Slot`.
        // Every state byte is a valid `SlotState` (zeroed or written by us)
        // and keys/values are `MaybeUninit`.
        unsafe {
            std::slice::from_raw_parts(self.block.as_ptr().cast::<Slot<K, V>>(), self.slot_count)
        }
    }

    #[track_caller]
    fn slots_mut(&mut self) -> &mut [Slot<K, V>] {
        self.block.assert_live();
        let slot_count = self.slot_count;
        // SAFETY: as in `slots`, plus uniqueness from `&mut self`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.block.as_mut_ptr().cast::<Slot<K, V>>(),
                slot_count,
            )
        }
    }

    fn probe(&self, key: &K) -> Probe {
        let slots = self.slots();
        let mask = self.slot_count - 1;
        let mut index = home_slot(key, self.slot_count);
        let mut first_tombstone = None;

        for _ in 0..self.slot_count {
            let slot = &slots[index];
            match slot.state {
                SlotState::Empty => return Probe::Vacant(first_tombstone.unwrap_or(index)),
                // SAFETY: occupied slots hold an initialized key.
                SlotState::Occupied if unsafe { slot.key.assume_init_ref() } == key => {
                    return Probe::Found(index);
                }
                SlotState::Occupied => {}
                SlotState::Tombstone => {
                    first_tombstone.get_or_insert(index);
                }
            }
            index = (index + 1) & mask;
        }

        match first_tombstone {
            Some(index) => Probe::Vacant(index),
            None => Probe::Full,
        }
    }

    fn find(&self, key: &K) -> Option<usize> {
        match self.probe(key) {
            Probe::Found(index) => Some(index),
            Probe::Vacant(_) | Probe::Full => None,
        }
    }

    fn value_at(&self, index: usize) -> &V {
        // SAFETY: only called with the index of an occupied slot.
        unsafe { self.slots()[index].value.assume_init_ref() }
    }

    fn value_at_mut(&mut self, index: usize) -> &mut V {
        // SAFETY: only called with the index of an occupied slot.
        unsafe { self.slots_mut()[index].value.assume_init_mut() }
    }

    /// Returns `true` if `key` has a live entry.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Returns a copy of the value for `key`, or `None`.
    #[must_use]
    pub fn try_get_value(&self, key: &K) -> Option<V> {
        self.find(key).map(|index| *self.value_at(index))
    }

    /// Returns a copy of the value for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] when the key is absent.
    pub fn get(&self, key: &K) -> Result<V> {
        self.try_get_value(key).ok_or(Error::KeyNotFound)
    }

    /// Borrows the value for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] when the key is absent.
    pub fn get_ref(&self, key: &K) -> Result<&V> {
        let index = self.find(key).ok_or(Error::KeyNotFound)?;
        Ok(self.value_at(index))
    }

    /// Mutably borrows the value for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] when the key is absent.
    pub fn get_mut(&mut self, key: &K) -> Result<&mut V> {
        let index = self.find(key).ok_or(Error::KeyNotFound)?;
        Ok(self.value_at_mut(index))
    }

    /// Grows or cleans the slot array if one more entry would pass the load
    /// factor.
    #[track_caller]
    fn reserve_one(&mut self) {
        let used = self.len + self.tombstones + 1;
        if used * LOAD_FACTOR_DEN <= self.slot_count * LOAD_FACTOR_NUM {
            return;
        }

        // Mostly tombstones: rebuilding at the same size frees enough room.
        let new_count = if (self.len + 1) * LOAD_FACTOR_DEN * 2 <= self.slot_count * LOAD_FACTOR_NUM
        {
            self.slot_count
        } else {
            self.slot_count * 2
        };
        self.rehash(new_count);
    }

    #[track_caller]
    fn rehash(&mut self, new_count: usize) {
        debug!(
            "rehashing table from {} to {new_count} slots ({} live, {} tombstones)",
            self.slot_count, self.len, self.tombstones
        );

        let mut block = allocate_slots::<K, V>(new_count);
        let mask = new_count - 1;
        // SAFETY: fresh zeroed block of `new_count` slots, all `Empty`.
        let fresh = unsafe {
            std::slice::from_raw_parts_mut(block.as_mut_ptr().cast::<Slot<K, V>>(), new_count)
        };

        for slot in self.slots() {
            if slot.state != SlotState::Occupied {
                continue;
            }
            // SAFETY: occupied slots hold an initialized key.
            let key = unsafe { slot.key.assume_init_ref() };
            let mut index = home_slot(key, new_count);
            while fresh[index].state != SlotState::Empty {
                index = (index + 1) & mask;
            }
            fresh[index] = Slot {
                state: SlotState::Occupied,
                key: slot.key,
                value: slot.value,
            };
        }

        let old = mem::replace(&mut self.block, block);
        if let Err(err) = old.dispose() {
            panic!("{err}");
        }
        self.slot_count = new_count;
        self.tombstones = 0;
        self.generation += 1;
    }

    /// Finds the slot for `key`, making room when it is absent.
    #[track_caller]
    fn probe_for_insert(&mut self, key: &K) -> Probe {
        if let Probe::Found(index) = self.probe(key) {
            return Probe::Found(index);
        }

        self.reserve_one();
        loop {
            match self.probe(key) {
                Probe::Full => self.rehash(self.slot_count * 2),
                probe => return probe,
            }
        }
    }

    fn occupy(&mut self, index: usize, key: K, value: V) {
        if self.slots()[index].state == SlotState::Tombstone {
            self.tombstones -= 1;
        }
        self.slots_mut()[index] = Slot {
            state: SlotState::Occupied,
            key: MaybeUninit::new(key),
            value: MaybeUninit::new(value),
        };
        self.len += 1;
    }

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateKey`] if `key` is already present; the table is
    /// left unchanged.
    #[track_caller]
    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        match self.probe_for_insert(&key) {
            Probe::Found(_) => Err(Error::DuplicateKey),
            Probe::Vacant(index) => {
                self.occupy(index, key, value);
                Ok(())
            }
            Probe::Full => unreachable!("probe_for_insert never reports a full table"),
        }
    }

    /// Inserts or overwrites, returning the previous value if there was one.
    #[track_caller]
    pub fn add_or_set(&mut self, key: K, value: V) -> Option<V> {
        match self.probe_for_insert(&key) {
            Probe::Found(index) => Some(mem::replace(self.value_at_mut(index), value)),
            Probe::Vacant(index) => {
                self.occupy(index, key, value);
                None
            }
            Probe::Full => unreachable!("probe_for_insert never reports a full table"),
        }
    }

    /// Inserts `V::default()` for `key` and returns it for in-place
    /// initialization.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateKey`] if `key` is already present.
    #[track_caller]
    pub fn add_ref(&mut self, key: K) -> Result<&mut V>
    where
        V: Default,
    {
        match self.probe_for_insert(&key) {
            Probe::Found(_) => Err(Error::DuplicateKey),
            Probe::Vacant(index) => {
                self.occupy(index, key, V::default());
                Ok(self.value_at_mut(index))
            }
            Probe::Full => unreachable!("probe_for_insert never reports a full table"),
        }
    }

    /// Removes `key`, returning its value, or `None` if it was absent.
    pub fn try_remove(&mut self, key: &K) -> Option<V> {
        let index = self.find(key)?;
        let value = *self.value_at(index);

        self.slots_mut()[index].state = SlotState::Tombstone;
        self.len -= 1;
        self.tombstones += 1;
        Some(value)
    }

    /// Removes `key`, returning its value.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] when the key is absent.
    pub fn remove(&mut self, key: &K) -> Result<V> {
        self.try_remove(key).ok_or(Error::KeyNotFound)
    }

    /// Key of the `index`-th live entry, counting occupied slots in physical
    /// order.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn key_at_index(&self, index: usize) -> Result<K> {
        self.keys()
            .nth(index)
            .ok_or(Error::OutOfRange { index, len: self.len })
    }

    /// Iterates over live entries in physical slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.slots().iter(),
            remaining: self.len,
        }
    }

    /// Iterates over live keys in physical slot order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Iterates over live values in physical slot order.
    pub fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    /// Marks every slot `Empty`. The allocation is kept.
    pub fn clear(&mut self) {
        self.block.zero();
        self.len = 0;
        self.tombstones = 0;
    }

    /// Frees the slot array, reporting any ledger inconsistency.
    ///
    /// # Errors
    ///
    /// Propagates [`Allocation::dispose`] errors.
    #[track_caller]
    pub fn dispose(self) -> Result<()> {
        self.block.dispose()
    }
}

/// Iterator over the live entries of a [`HashTable`].
pub struct Iter<'a, K, V> {
    slots: std::slice::Iter<'a, Slot<K, V>>,
    remaining: usize,
}

impl<K: Copy, V: Copy> Iterator for Iter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        for slot in self.slots.by_ref() {
            if slot.state == SlotState::Occupied {
                self.remaining -= 1;
                // SAFETY: occupied slots hold an initialized key and value.
                return Some(unsafe { (slot.key.assume_init(), slot.value.assume_init()) });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K: Copy, V: Copy> ExactSizeIterator for Iter<'_, K, V> {}

impl<'a, K, V> IntoIterator for &'a HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V> Default for HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K, V> Clone for HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn clone(&self) -> Self {
        HashTable {
            block: self.block.clone(),
            slot_count: self.slot_count,
            len: self.len,
            tombstones: self.tombstones,
            generation: 0,
            _marker: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for HashTable<K, V>
where
    K: Copy + Eq + Hash + fmt::Debug,
    V: Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> Extend<(K, V)> for HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.add_or_set(key, value);
        }
    }
}

impl<K, V> FromIterator<(K, V)> for HashTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = HashTable::new();
        table.extend(iter);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_keeps_chains_intact() {
        let mut table = HashTable::<i32, &'static str>::with_capacity(4);
        table.add(1, "a").unwrap();
        table.add(2, "b").unwrap();
        table.add(3, "c").unwrap();
        assert_eq!(table.capacity(), 4);

        assert_eq!(table.remove(&2), Ok("b"));
        assert!(!table.contains_key(&2));
        assert!(table.contains_key(&1));
        assert!(table.contains_key(&3));
        assert_eq!(table.get(&3), Ok("c"));
        assert_eq!(table.tombstone_count(), 1);
    }

    #[test]
    fn test_remove_every_other_key() {
        let mut table = HashTable::<u64, u64>::with_capacity(16);
        for key in 0..12 {
            table.add(key, key * 10).unwrap();
        }
        for key in (0..12).step_by(2) {
            table.remove(&key).unwrap();
        }
        for key in 0..12 {
            assert_eq!(table.contains_key(&key), key % 2 == 1, "key {key}");
        }
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut table = HashTable::<u32, u32>::new();
        table.add(7, 1).unwrap();
        assert_eq!(table.add(7, 2), Err(Error::DuplicateKey));
        assert_eq!(table.get(&7), Ok(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_or_set() {
        let mut table = HashTable::<u32, u32>::new();
        assert_eq!(table.add_or_set(1, 10), None);
        assert_eq!(table.add_or_set(1, 11), Some(10));
        assert_eq!(table.get(&1), Ok(11));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_ref() {
        let mut table = HashTable::<u8, [u32; 2]>::new();
        let value = table.add_ref(4).unwrap();
        assert_eq!(*value, [0, 0]);
        value[1] = 9;

        assert_eq!(table.get(&4), Ok([0, 9]));
        assert!(table.add_ref(4).is_err());
    }

    #[test]
    fn test_missing_keys() {
        let mut table = HashTable::<u16, u16>::new();
        assert_eq!(table.get(&1), Err(Error::KeyNotFound));
        assert_eq!(table.try_get_value(&1), None);
        assert_eq!(table.remove(&1), Err(Error::KeyNotFound));
        assert_eq!(table.try_remove(&1), None);
        assert!(table.get_mut(&1).is_err());
    }

    #[test]
    fn test_growth_reinserts_live_entries() {
        let mut table = HashTable::<u32, u32>::with_capacity(2);
        for key in 0..100 {
            table.add(key, key + 1).unwrap();
        }

        assert_eq!(table.len(), 100);
        assert!(table.capacity().is_power_of_two());
        assert!(table.capacity() * 3 >= table.len() * 4);
        assert!(table.generation() > 0);
        for key in 0..100 {
            assert_eq!(table.get(&key), Ok(key + 1));
        }
    }

    #[test]
    fn test_churn_rehashes_in_place() {
        let mut table = HashTable::<u32, u32>::with_capacity(16);
        for round in 0..100 {
            table.add(round, round).unwrap();
            table.remove(&round).unwrap();
        }

        assert!(table.is_empty());
        assert_eq!(table.capacity(), 16);
        assert!(table.tombstone_count() * LOAD_FACTOR_DEN <= table.capacity() * LOAD_FACTOR_NUM);
    }

    #[test]
    fn test_key_at_index() {
        let mut table = HashTable::<u32, ()>::with_capacity(8);
        for key in [5, 1, 3] {
            table.add(key, ()).unwrap();
        }

        let mut keys: Vec<u32> = (0..3).map(|i| table.key_at_index(i).unwrap()).collect();
        assert_eq!(keys, table.keys().collect::<Vec<_>>());
        keys.sort_unstable();
        assert_eq!(keys, [1, 3, 5]);

        assert_eq!(
            table.key_at_index(3),
            Err(Error::OutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut table: HashTable<u32, u32> = (0..5).map(|k| (k, k)).collect();
        let capacity = table.capacity();
        table.remove(&0).unwrap();

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.tombstone_count(), 0);
        assert_eq!(table.capacity(), capacity);
        assert!(!table.contains_key(&1));
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut table = HashTable::<u32, u32>::new();
        table.add(1, 1).unwrap();
        let copy = table.clone();
        table.add_or_set(1, 2);

        assert_eq!(copy.get(&1), Ok(1));
        assert_eq!(format!("{copy:?}"), "{1: 1}");
    }

    #[test]
    fn test_strided_keys_spread_over_slots() {
        let slots = 128;
        let mut homes: Vec<usize> = (0..64u64).map(|i| home_slot(&(i << 12), slots)).collect();
        homes.sort_unstable();
        homes.dedup();
        assert!(homes.len() >= 32, "only {} distinct home slots", homes.len());
        assert!(homes.iter().all(|&home| home < slots));
        assert_eq!(home_slot(&12345u64, 1), 0);
    }

    #[test]
    fn test_address_like_keys() {
        let mut table = HashTable::<usize, u32>::new();
        for i in 0..2_000u32 {
            table.add(0x7f00_0000_0000 + (i as usize) * 4096, i).unwrap();
        }
        for i in (0..2_000u32).step_by(3) {
            assert_eq!(table.remove(&(0x7f00_0000_0000 + (i as usize) * 4096)), Ok(i));
        }
        for i in 0..2_000u32 {
            let key = 0x7f00_0000_0000 + (i as usize) * 4096;
            assert_eq!(table.try_get_value(&key), (i % 3 != 0).then_some(i));
        }
    }
}
