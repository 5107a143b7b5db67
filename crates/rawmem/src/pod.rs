//! Plain-old-data marker for byte reinterpretation.

/// Types that may be read from, and written as, raw bytes.
///
/// Allocations, spans over raw memory and the binary cursors reinterpret
/// bytes as `T`. That is only sound when every bit pattern is a valid `T` and
/// the type has no padding (padding bytes are uninitialized and must not be
/// copied out).
///
/// # Safety
///
/// Implementors must be `Copy`, have no padding bytes, contain no pointers
/// or references, and accept every bit pattern of `size_of::<Self>()` bytes
/// as a valid value.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! impl_pod {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: primitive numeric types accept every bit pattern and
            // have no padding.
            unsafe impl Pod for $ty {}
        )*
    };
}

impl_pod!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

// SAFETY: an array of `Pod` has no padding between elements and inherits the
// element's validity.
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_pod<T: Pod>() {}

    #[test]
    fn test_pod_impls() {
        assert_pod::<u8>();
        assert_pod::<f64>();
        assert_pod::<[u32; 4]>();
        assert_pod::<[[i16; 2]; 3]>();
    }
}
