//! Bounds-checked views over contiguous elements.
//!
//! [`Span`] and [`SpanMut`] never own memory. They borrow from an
//! [`Allocation`](crate::Allocation), a [`DynArray`](crate::DynArray), a
//! cursor, or any ordinary slice, and the borrow checker keeps them from
//! outliving (or observing a reallocation of) what they view.
//!
//! Every indexed access is checked and reports [`Error::OutOfRange`]; the
//! `Index` impls panic with the same message, like std slices do.

use crate::error::{Error, Result, check_index, check_range};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Index, IndexMut};

/// A shared view over `len` elements of `T`.
pub struct Span<'a, T> {
    items: &'a [T],
}

impl<T> Clone for Span<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Span<'_, T> {}

impl<'a, T> Span<'a, T> {
    /// A span with no elements.
    #[must_use]
    pub const fn empty() -> Self {
        Span { items: &[] }
    }

    /// Views an existing slice.
    #[must_use]
    pub const fn new(items: &'a [T]) -> Self {
        Span { items }
    }

    /// Builds a span from a pointer and element count.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts`]: `ptr` must be
    /// aligned, non-null and valid for reads of `len` initialized elements for
    /// the whole of `'a`, with no mutable alias.
    #[must_use]
    pub unsafe fn from_raw_parts(ptr: *const T, len: usize) -> Self {
        // SAFETY: forwarded to the caller.
        Span {
            items: unsafe { std::slice::from_raw_parts(ptr, len) },
        }
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when the span has no elements.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The viewed elements as a slice.
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &'a [T] {
        self.items
    }

    /// Pointer to the first element.
    #[must_use]
    pub const fn as_ptr(&self) -> *const T {
        self.items.as_ptr()
    }

    /// Iterates over the elements.
    pub fn iter(&self) -> std::slice::Iter<'a, T> {
        self.items.iter()
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    #[inline]
    pub fn get(&self, index: usize) -> Result<&'a T> {
        check_index(index, self.items.len())?;
        Ok(&self.items[index])
    }

    /// Returns the element at `index`, or `None` when out of range.
    #[inline]
    #[must_use]
    pub fn try_get(&self, index: usize) -> Option<&'a T> {
        self.items.get(index)
    }

    /// Returns the element at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    #[inline]
    #[must_use]
    pub unsafe fn get_unchecked(&self, index: usize) -> &'a T {
        // SAFETY: forwarded to the caller.
        unsafe { self.items.get_unchecked(index) }
    }

    /// Sub-span of `length` elements starting at `start`, or the rest of the
    /// span when `length` is `None`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when the requested range exceeds the span.
    pub fn slice(&self, start: usize, length: Option<usize>) -> Result<Span<'a, T>> {
        let len = self.items.len();
        if start > len {
            return Err(Error::OutOfRange { index: start, len });
        }

        let length = length.unwrap_or(len - start);
        check_range(start, length, len)?;
        Ok(Span {
            items: &self.items[start..start + length],
        })
    }

    /// Shorthand for `slice(start, None)`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `start > len`.
    pub fn slice_from(&self, start: usize) -> Result<Span<'a, T>> {
        self.slice(start, None)
    }

    /// Copies every element into the front of `dst`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `dst` is shorter than this span.
    pub fn copy_to(&self, dst: &mut SpanMut<'_, T>) -> Result<()>
    where
        T: Copy,
    {
        let len = self.items.len();
        check_range(0, len, dst.items.len())?;
        dst.items[..len].copy_from_slice(self.items);
        Ok(())
    }

    /// Copies the elements into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.to_vec()
    }
}

impl<T: PartialEq> Span<'_, T> {
    /// Index of the first element equal to `value`.
    #[must_use]
    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.items.iter().position(|item| item == value)
    }

    /// Index of the last element equal to `value`.
    #[must_use]
    pub fn last_index_of(&self, value: &T) -> Option<usize> {
        self.items.iter().rposition(|item| item == value)
    }

    /// Returns `true` if some element equals `value`.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.index_of(value).is_some()
    }

    /// Start of the first occurrence of `needle`. An empty needle matches at 0.
    #[must_use]
    pub fn index_of_seq(&self, needle: &[T]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.items.windows(needle.len()).position(|window| window == needle)
    }

    /// Start of the last occurrence of `needle`. An empty needle matches at `len`.
    #[must_use]
    pub fn last_index_of_seq(&self, needle: &[T]) -> Option<usize> {
        if needle.is_empty() {
            return Some(self.items.len());
        }
        self.items.windows(needle.len()).rposition(|window| window == needle)
    }

    /// Start of the first occurrence of `needle`.
    ///
    /// # Errors
    ///
    /// [`Error::ElementNotFound`] when there is no occurrence.
    pub fn find_seq(&self, needle: &[T]) -> Result<usize> {
        self.index_of_seq(needle).ok_or(Error::ElementNotFound)
    }

    /// Returns `true` when both spans hold equal elements in the same order.
    #[must_use]
    pub fn sequence_eq(&self, other: &[T]) -> bool {
        self.items == other
    }
}

impl<T: Hash> Span<'_, T> {
    /// Stable FxHash of the length and elements.
    ///
    /// Equal sequences hash equally across runs of the same build.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        fxhash::hash64(self.items)
    }
}

impl<T> Default for Span<'_, T> {
    fn default() -> Self {
        Span::empty()
    }
}

impl<'a, T> From<&'a [T]> for Span<'a, T> {
    fn from(items: &'a [T]) -> Self {
        Span { items }
    }
}

impl<'a, T, const N: usize> From<&'a [T; N]> for Span<'a, T> {
    fn from(items: &'a [T; N]) -> Self {
        Span { items }
    }
}

impl<T> Index<usize> for Span<'_, T> {
    type Output = T;

    #[track_caller]
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(item) => item,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, T> IntoIterator for Span<'a, T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: PartialEq> PartialEq for Span<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_eq(other.items)
    }
}

impl<T: Eq> Eq for Span<'_, T> {}

impl<T: Hash> Hash for Span<'_, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.items.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Span<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items).finish()
    }
}

/// An exclusive view over `len` elements of `T`.
pub struct SpanMut<'a, T> {
    items: &'a mut [T],
}

impl<'a, T> SpanMut<'a, T> {
    /// Views an existing mutable slice.
    #[must_use]
    pub fn new(items: &'a mut [T]) -> Self {
        SpanMut { items }
    }

    /// Builds a mutable span from a pointer and element count.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts_mut`].
    #[must_use]
    pub unsafe fn from_raw_parts(ptr: *mut T, len: usize) -> Self {
        // SAFETY: forwarded to the caller.
        SpanMut {
            items: unsafe { std::slice::from_raw_parts_mut(ptr, len) },
        }
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when the span has no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reborrows as a shared span.
    #[must_use]
    pub fn as_span(&self) -> Span<'_, T> {
        Span { items: self.items }
    }

    /// Converts into a shared span for the full lifetime.
    #[must_use]
    pub fn into_span(self) -> Span<'a, T> {
        Span { items: self.items }
    }

    /// The viewed elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.items
    }

    /// The viewed elements as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.items
    }

    /// Iterates over the elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Iterates mutably over the elements.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Returns the element at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn get(&self, index: usize) -> Result<&T> {
        check_index(index, self.items.len())?;
        Ok(&self.items[index])
    }

    /// Returns the element at `index` mutably.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `index >= len`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        check_index(index, self.items.len())?;
        Ok(&mut self.items[index])
    }

    /// Mutable sub-span, as in [`Span::slice`].
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when the requested range exceeds the span.
    pub fn slice_mut(&mut self, start: usize, length: Option<usize>) -> Result<SpanMut<'_, T>> {
        let len = self.items.len();
        if start > len {
            return Err(Error::OutOfRange { index: start, len });
        }

        let length = length.unwrap_or(len - start);
        check_range(start, length, len)?;
        Ok(SpanMut {
            items: &mut self.items[start..start + length],
        })
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.items.fill(value);
    }

    /// Resets every element to its default.
    pub fn clear(&mut self)
    where
        T: Default,
    {
        self.items.fill_with(T::default);
    }

    /// Copies `src` into the front of this span.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] when `src` is longer than this span.
    pub fn copy_from(&mut self, src: &[T]) -> Result<()>
    where
        T: Copy,
    {
        check_range(0, src.len(), self.items.len())?;
        self.items[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl<T> Index<usize> for SpanMut<'_, T> {
    type Output = T;

    #[track_caller]
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(item) => item,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T> IndexMut<usize> for SpanMut<'_, T> {
    #[track_caller]
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Ok(item) => item,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<'a, T> From<&'a mut [T]> for SpanMut<'a, T> {
    fn from(items: &'a mut [T]) -> Self {
        SpanMut { items }
    }
}

impl<T: fmt::Debug> fmt::Debug for SpanMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_past_len_is_range_error() {
        for len in 0..8usize {
            let data: Vec<u32> = (0..len as u32).collect();
            let span = Span::new(&data);

            for index in len..len + 3 {
                assert_eq!(span.get(index), Err(Error::OutOfRange { index, len }));
                assert_eq!(span.try_get(index), None);
            }
            for index in 0..len {
                assert_eq!(*span.get(index).unwrap(), index as u32);
            }
        }
    }

    #[test]
    #[should_panic(expected = "Index 3 out of range for length 3")]
    fn test_index_operator_panics() {
        let span = Span::from(&[1, 2, 3]);
        let _ = span[3];
    }

    #[test]
    fn test_empty_span() {
        let span: Span<'_, u8> = Span::empty();
        assert!(span.is_empty());
        assert_eq!(span.len(), 0);
        assert!(span.slice(0, None).unwrap().is_empty());
        assert!(span.get(0).is_err());
    }

    #[test]
    fn test_slice() {
        let span = Span::from(&[0, 1, 2, 3, 4, 5]);

        assert_eq!(span.slice(2, Some(3)).unwrap().as_slice(), &[2, 3, 4]);
        assert_eq!(span.slice_from(4).unwrap().as_slice(), &[4, 5]);
        assert!(span.slice(6, None).unwrap().is_empty());

        assert_eq!(
            span.slice(7, None),
            Err(Error::OutOfRange { index: 7, len: 6 })
        );
        assert_eq!(
            span.slice(4, Some(3)),
            Err(Error::OutOfRange { index: 7, len: 6 })
        );
    }

    #[test]
    fn test_element_search() {
        let span = Span::from(&[3, 1, 4, 1, 5]);

        assert_eq!(span.index_of(&1), Some(1));
        assert_eq!(span.last_index_of(&1), Some(3));
        assert_eq!(span.index_of(&9), None);
        assert!(span.contains(&5));
        assert!(!span.contains(&2));
    }

    #[test]
    fn test_sequence_search() {
        let span = Span::from(b"abcabcab");

        assert_eq!(span.index_of_seq(b"bca"), Some(1));
        assert_eq!(span.last_index_of_seq(b"abc"), Some(3));
        assert_eq!(span.last_index_of_seq(b"ab"), Some(6));
        assert_eq!(span.index_of_seq(b"cc"), None);
        assert_eq!(span.index_of_seq(b""), Some(0));
        assert_eq!(span.last_index_of_seq(b""), Some(8));
        assert_eq!(span.index_of_seq(b"abcabcabc"), None);
        assert_eq!(span.find_seq(b"zz"), Err(Error::ElementNotFound));
    }

    #[test]
    fn test_equality_and_hash() {
        let a = [1u16, 2, 3];
        let b = vec![1u16, 2, 3];
        let c = [1u16, 2, 4];

        assert_eq!(Span::from(&a), Span::new(&b));
        assert_ne!(Span::from(&a), Span::from(&c));
        assert!(Span::from(&a).sequence_eq(&b));

        assert_eq!(Span::from(&a).content_hash(), Span::new(&b).content_hash());
        assert_ne!(Span::from(&a).content_hash(), Span::from(&c).content_hash());
        assert_ne!(
            Span::from(&a).content_hash(),
            Span::from(&a[..2]).content_hash()
        );
    }

    #[test]
    fn test_copy_fill_clear() {
        let src = [9, 8, 7];
        let mut dst = [0; 5];
        let mut view = SpanMut::new(&mut dst);

        Span::from(&src).copy_to(&mut view).unwrap();
        assert_eq!(view.as_slice(), &[9, 8, 7, 0, 0]);

        view.slice_mut(3, None).unwrap().fill(1);
        assert_eq!(view.as_slice(), &[9, 8, 7, 1, 1]);

        view.clear();
        assert_eq!(view.as_slice(), &[0; 5]);

        let mut short = [0; 2];
        assert!(Span::from(&src).copy_to(&mut SpanMut::new(&mut short)).is_err());
        assert!(SpanMut::new(&mut short).copy_from(&src).is_err());
    }

    #[test]
    fn test_span_mut_index() {
        let mut data = [1, 2, 3];
        let mut view = SpanMut::new(&mut data);
        view[1] = 20;
        *view.get_mut(2).unwrap() += 10;

        assert_eq!(view.as_span().as_slice(), &[1, 20, 13]);
        assert!(view.get_mut(3).is_err());
        assert_eq!(view.into_span().len(), 3);
    }
}
