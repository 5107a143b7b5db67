//! Growable array backed by a single ledger-tracked allocation.
//!
//! [`DynArray`] stores `Copy` elements contiguously in one [`Allocation`].
//! Appending past capacity grows the block geometrically (doubling, or up to
//! the next power of two for large batches), which may move it. Borrowed
//! [`Span`]s cannot outlive such a move; detached [`ViewToken`]s record the
//! array's generation and fail with [`Error::StaleView`] once it changes.
//!
//! # Example
//!
//! ```
//! use rawmem::DynArray;
//!
//! let mut array = DynArray::with_capacity(1);
//! for value in [10, 20, 30, 40, 50] {
//!     array.add(value);
//! }
//!
//! assert_eq!(array.len(), 5);
//! assert!(array.capacity() >= 5);
//! assert_eq!(array.as_slice(), &[10, 20, 30, 40, 50]);
//! ```

use crate::alloc::{Allocation, natural_alignment};
use crate::config::DEFAULT_ARRAY_CAPACITY;
use crate::error::{Error, Result, check_index};
use crate::span::{Span, SpanMut};
use rawmem_log::debug;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Index, IndexMut};
use std::ptr;

/// A generation recorded from a collection, checked before reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewToken {
    generation: u64,
}

impl ViewToken {
    /// Generation the token was taken at.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A resizable array of `Copy` elements in ledger-tracked memory.
pub struct DynArray<T: Copy> {
    block: Allocation,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the array owns its elements exclusively, like `Vec<T>`.
unsafe impl<T: Copy + Send> Send for DynArray<T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Copy + Sync> Sync for DynArray<T> {}

/// Bytes needed for `capacity` elements, or `None` past what a layout allows.
fn bytes_for<T>(capacity: usize) -> Option<usize> {
    let bytes = capacity.checked_mul(mem::size_of::<T>())?;
    (bytes <= isize::MAX as usize - mem::align_of::<T>().max(8)).then_some(bytes)
}

impl<T: Copy> DynArray<T> {
    /// Creates an empty array with the default capacity.
    #[track_caller]
    #[must_use]
    pub fn new() -> Self {
        DynArray::with_capacity(DEFAULT_ARRAY_CAPACITY)
    }

    /// Creates an empty array with room for `capacity` elements.
    ///
    /// A capacity of zero is raised to one.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or the capacity in bytes overflows.
    #[track_caller]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        const { assert!(mem::size_of::<T>() != 0, "DynArray does not support zero-sized types") };

        let capacity = capacity.max(1);
        let Some(bytes) = bytes_for::<T>(capacity) else {
            panic!("{}", Error::InvalidCapacity { requested: capacity });
        };

        let align = mem::align_of::<T>().max(natural_alignment(bytes));
        DynArray {
            block: Allocation::with_alignment(bytes, align),
            len: 0,
            capacity,
            _marker: PhantomData,
        }
    }

    /// Creates an array holding a copy of `values`.
    #[track_caller]
    #[must_use]
    pub fn from_slice(values: &[T]) -> Self {
        let mut array = DynArray::with_capacity(values.len());
        array.add_range(values);
        array
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of elements the current block can hold.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when the array has no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of times the backing block has been reallocated.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.block.generation()
    }

    #[inline]
    fn base(&self) -> *const T {
        self.block.as_ptr().cast::<T>()
    }

    #[inline]
    fn base_mut(&mut self) -> *mut T {
        self.block.as_mut_ptr().cast::<T>()
    }

    /// The elements as a slice.
    #[track_caller]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.block.assert_live();
        // SAFETY: the block is aligned for `T` and the first `len` elements
        // were written.
        unsafe { std::slice::from_raw_parts(self.base(), self.len) }
    }

    /// The elements as a mutable slice.
    #[track_caller]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.block.assert_live();
        let len = self.len;
        // SAFETY: as in `as_slice`, plus uniqueness from `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.base_mut(), len) }
    }

    /// Borrows the elements as a span.
    #[track_caller]
    #[must_use]
    pub fn as_span(&self) -> Span<'_, T> {
        Span::new(self.as_slice())
    }

    /// Borrows the elements as a mutable span.
    #[track_caller]
    #[must_use]
    pub fn as_span_mut(&mut self) -> SpanMut<'_, T> {
        SpanMut::new(self.as_mut_slice())
    }

    /// Iterates over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Records the current generation for a later [`span_for`](DynArray::span_for).
    #[must_use]
    pub fn view_token(&self) -> ViewToken {
        ViewToken {
            generation: self.generation(),
        }
    }

    /// Re-borrows the elements if no reallocation happened since `token`.
    ///
    /// # Errors
    ///
    /// [`Error::StaleView`] when the array has grown since the token was taken.
    pub fn span_for(&self, token: ViewToken) -> Result<Span<'_, T>> {
        let actual = self.generation();
        if token.generation != actual {
            return Err(Error::StaleView {
                expected: token.generation,
                actual,
            });
        }
        Ok(self.as_span())
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn get(&self, index: usize) -> Result<&T> {
        check_index(index, self.len)?;
        Ok(&self.as_slice()[index])
    }

    /// Returns the element at `index` mutably.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        check_index(index, self.len)?;
        Ok(&mut self.as_mut_slice()[index])
    }

    /// Returns the element at `index`, or `None` when out of range.
    #[must_use]
    pub fn try_get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Returns the element at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    #[must_use]
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.base().add(index) }
    }

    /// Overwrites the element at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        *self.get_mut(index)? = value;
        Ok(())
    }

    /// Ensures room for `additional` more elements, growing at most once.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] when the required capacity overflows.
    #[track_caller]
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self
            .len
            .checked_add(additional)
            .ok_or(Error::InvalidCapacity { requested: usize::MAX })?;
        if required <= self.capacity {
            return Ok(());
        }

        let doubled = self.capacity.saturating_mul(2);
        let rounded = required.checked_next_power_of_two().unwrap_or(required);
        let new_capacity = doubled.max(rounded);

        let bytes = bytes_for::<T>(new_capacity)
            .or_else(|| bytes_for::<T>(required))
            .ok_or(Error::InvalidCapacity { requested: required })?;
        let new_capacity = bytes / mem::size_of::<T>();

        debug!(
            "growing array of {} from {} to {new_capacity} elements",
            std::any::type_name::<T>(),
            self.capacity
        );
        self.block.resize(bytes)?;
        self.capacity = new_capacity;
        Ok(())
    }

    #[track_caller]
    fn reserve_or_panic(&mut self, additional: usize) {
        if let Err(err) = self.reserve(additional) {
            panic!("{err}");
        }
    }

    /// Appends `value`, growing the block when full.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity overflows.
    #[track_caller]
    pub fn add(&mut self, value: T) {
        if self.len == self.capacity {
            self.reserve_or_panic(1);
        }

        let len = self.len;
        // SAFETY: `len < capacity` after the reserve above.
        unsafe { self.base_mut().add(len).write(value) };
        self.len += 1;
    }

    /// Appends every element of `values` with a single growth.
    ///
    /// # Panics
    ///
    /// Panics if the new capacity overflows.
    #[track_caller]
    pub fn add_range(&mut self, values: &[T]) {
        self.reserve_or_panic(values.len());

        let len = self.len;
        // SAFETY: capacity covers `len + values.len()`; `values` cannot alias
        // the block while `&mut self` is held.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.base_mut().add(len), values.len());
        }
        self.len += values.len();
    }

    /// Inserts `value` at `index`, shifting the tail right.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index > len`.
    #[track_caller]
    pub fn insert(&mut self, index: usize, value: T) -> Result<()> {
        check_index(index, self.len + 1)?;
        self.reserve(1)?;

        let len = self.len;
        let base = self.base_mut();
        // SAFETY: `index <= len < capacity`; `ptr::copy` handles the overlap.
        unsafe {
            ptr::copy(base.add(index), base.add(index + 1), len - index);
            base.add(index).write(value);
        }
        self.len += 1;
        Ok(())
    }

    /// Removes the element at `index`, shifting the tail left.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn remove_at(&mut self, index: usize) -> Result<T> {
        check_index(index, self.len)?;

        let len = self.len;
        let base = self.base_mut();
        // SAFETY: `index < len`, and the moved tail stays within `len`.
        let removed = unsafe {
            let removed = base.add(index).read();
            ptr::copy(base.add(index + 1), base.add(index), len - index - 1);
            removed
        };
        self.len -= 1;
        Ok(removed)
    }

    /// Removes the element at `index` by moving the last element into its
    /// place. O(1), but does not preserve order.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn remove_at_swap(&mut self, index: usize) -> Result<T> {
        check_index(index, self.len)?;

        let last = self.len - 1;
        let base = self.base_mut();
        // SAFETY: both `index` and `last` are below `len`.
        let removed = unsafe {
            let removed = base.add(index).read();
            base.add(index).write(base.add(last).read());
            removed
        };
        self.len = last;
        Ok(removed)
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: the old last index is below the old `len`.
        Some(unsafe { self.base().add(self.len).read() })
    }

    /// Removes every element. Capacity is kept.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Frees the backing block, reporting any ledger inconsistency.
    ///
    /// # Errors
    ///
    /// Propagates [`Allocation::dispose`] errors.
    #[track_caller]
    pub fn dispose(self) -> Result<()> {
        self.block.dispose()
    }
}

impl<T: Copy + PartialEq> DynArray<T> {
    /// Index of the first element equal to `value`.
    #[must_use]
    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.as_span().index_of(value)
    }

    /// Index of the last element equal to `value`.
    #[must_use]
    pub fn last_index_of(&self, value: &T) -> Option<usize> {
        self.as_span().last_index_of(value)
    }

    /// Returns `true` if some element equals `value`.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.index_of(value).is_some()
    }

    /// Removes the first element equal to `value` and returns its index.
    ///
    /// # Errors
    ///
    /// [`Error::ElementNotFound`] when no element matches.
    pub fn remove_value(&mut self, value: &T) -> Result<usize> {
        let index = self.index_of(value).ok_or(Error::ElementNotFound)?;
        self.remove_at(index)?;
        Ok(index)
    }
}

impl<T: Copy> Default for DynArray<T> {
    fn default() -> Self {
        DynArray::new()
    }
}

impl<T: Copy> Clone for DynArray<T> {
    fn clone(&self) -> Self {
        DynArray::from_slice(self.as_slice())
    }
}

impl<T: Copy> Index<usize> for DynArray<T> {
    type Output = T;

    #[track_caller]
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(item) => item,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Copy> IndexMut<usize> for DynArray<T> {
    #[track_caller]
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Ok(item) => item,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Copy + PartialEq> PartialEq for DynArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Copy + Eq> Eq for DynArray<T> {}

impl<T: Copy + fmt::Debug> fmt::Debug for DynArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: Copy> FromIterator<T> for DynArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut array = DynArray::new();
        array.extend(iter);
        array
    }
}

impl<T: Copy> Extend<T> for DynArray<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        self.reserve_or_panic(iter.size_hint().0);
        for value in iter {
            self.add(value);
        }
    }
}

impl<'a, T: Copy> IntoIterator for &'a DynArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_from_capacity_one() {
        let mut array = DynArray::<i32>::with_capacity(1);
        assert_eq!(array.capacity(), 1);

        for value in [10, 20, 30, 40, 50] {
            array.add(value);
        }

        assert_eq!(array.len(), 5);
        assert!(array.capacity() >= 5);
        assert_eq!(array.as_slice(), &[10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let array = DynArray::<u64>::with_capacity(0);
        assert_eq!(array.capacity(), 1);
        assert!(array.is_empty());
    }

    #[test]
    fn test_growth_doubles() {
        let mut array = DynArray::<u16>::with_capacity(3);
        for i in 0..4 {
            array.add(i);
        }
        assert_eq!(array.capacity(), 6);
        assert_eq!(array.generation(), 1);
    }

    #[test]
    fn test_add_range_grows_once() {
        let mut array = DynArray::<u32>::with_capacity(2);
        array.add(1);

        let batch: Vec<u32> = (2..=20).collect();
        array.add_range(&batch);

        assert_eq!(array.generation(), 1);
        assert_eq!(array.capacity(), 32);
        assert_eq!(array.len(), 20);
        assert_eq!(array[19], 20);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut array = DynArray::from_slice(&[1, 2, 4]);

        array.insert(2, 3).unwrap();
        array.insert(0, 0).unwrap();
        array.insert(5, 5).unwrap();
        assert_eq!(array.as_slice(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(
            array.insert(7, 9),
            Err(Error::OutOfRange { index: 7, len: 7 })
        );

        assert_eq!(array.remove_at(1), Ok(1));
        assert_eq!(array.as_slice(), &[0, 2, 3, 4, 5]);

        assert_eq!(array.remove_at_swap(0), Ok(0));
        assert_eq!(array.as_slice(), &[5, 2, 3, 4]);

        assert_eq!(array.remove_at(4), Err(Error::OutOfRange { index: 4, len: 4 }));
        assert_eq!(array.pop(), Some(4));
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn test_remove_last_by_swapping() {
        let mut array = DynArray::from_slice(&[7, 8]);
        assert_eq!(array.remove_at_swap(1), Ok(8));
        assert_eq!(array.as_slice(), &[7]);
        assert_eq!(array.remove_at_swap(0), Ok(7));
        assert!(array.is_empty());
        assert_eq!(array.pop(), None);
    }

    #[test]
    fn test_search() {
        let mut array = DynArray::from_slice(&['a', 'b', 'c', 'b']);

        assert_eq!(array.index_of(&'b'), Some(1));
        assert_eq!(array.last_index_of(&'b'), Some(3));
        assert!(array.contains(&'c'));
        assert!(!array.contains(&'z'));

        assert_eq!(array.remove_value(&'b'), Ok(1));
        assert_eq!(array.remove_value(&'z'), Err(Error::ElementNotFound));
        assert_eq!(array.as_slice(), &['a', 'c', 'b']);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut array: DynArray<u8> = (0..10).collect();
        let capacity = array.capacity();

        array.clear();
        assert!(array.is_empty());
        assert_eq!(array.capacity(), capacity);

        array.add(1);
        assert_eq!(array.as_slice(), &[1]);
    }

    #[test]
    fn test_get_and_set() {
        let mut array = DynArray::from_slice(&[1.5f64, 2.5]);

        assert_eq!(array.get(1), Ok(&2.5));
        assert_eq!(array.get(2), Err(Error::OutOfRange { index: 2, len: 2 }));
        assert_eq!(array.try_get(2), None);

        array.set(0, 9.0).unwrap();
        array[1] = 8.0;
        assert_eq!(array.as_slice(), &[9.0, 8.0]);
        assert!(array.set(5, 1.0).is_err());
    }

    #[test]
    #[should_panic(expected = "Index 3 out of range for length 3")]
    fn test_index_panics() {
        let array = DynArray::from_slice(&[1, 2, 3]);
        let _ = array[3];
    }

    #[test]
    fn test_view_token_goes_stale() {
        let mut array = DynArray::<u32>::with_capacity(2);
        array.add(1);

        let token = array.view_token();
        assert_eq!(array.span_for(token).unwrap().as_slice(), &[1]);

        array.add(2);
        assert!(array.span_for(token).is_ok());

        array.add(3);
        assert_eq!(
            array.span_for(token),
            Err(Error::StaleView { expected: 0, actual: 1 })
        );
        assert_eq!(array.span_for(array.view_token()).unwrap().len(), 3);
    }

    #[test]
    fn test_padded_elements() {
        let mut array = DynArray::<(u8, u32)>::new();
        for i in 0..10u8 {
            array.add((i, u32::from(i) * 1000));
        }
        array.remove_at(0).unwrap();
        array.insert(3, (99, 99)).unwrap();

        assert_eq!(array[0], (1, 1000));
        assert_eq!(array[3], (99, 99));
        assert_eq!(array.len(), 10);
    }

    #[test]
    fn test_clone_and_eq() {
        let array = DynArray::from_slice(&[3, 1, 2]);
        let mut copy = array.clone();
        assert_eq!(array, copy);

        copy.add(4);
        assert_ne!(array, copy);
        assert_eq!(format!("{array:?}"), "[3, 1, 2]");
    }

    #[test]
    fn test_reserve_overflow() {
        let mut array = DynArray::<u64>::new();
        assert!(matches!(
            array.reserve(usize::MAX),
            Err(Error::InvalidCapacity { .. })
        ));
        assert!(array.reserve(100).is_ok());
        assert!(array.capacity() >= 100);
    }

    #[test]
    fn test_dispose() {
        let array = DynArray::from_slice(&[1u8, 2, 3]);
        array.dispose().unwrap();
    }
}
