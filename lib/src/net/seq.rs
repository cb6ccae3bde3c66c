//! TCP sequence-number arithmetic, strictly modulo 2³².
//!
//! Comparisons use signed-difference semantics so they are invariant under
//! adding 2³² to both arguments.

/// `a < b` in sequence space.
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
pub fn le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a > b` in sequence space.
pub fn gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a >= b` in sequence space.
pub fn ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Advance a sequence number.
pub fn add(a: u32, n: u32) -> u32 {
    a.wrapping_add(n)
}

/// Signed distance from `b` to `a`.
pub fn diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn comparisons_wrap() {
        // 100 is "after" u32::MAX - 100 in sequence space.
        assert!(gt(100, u32::MAX - 100));
        assert!(lt(u32::MAX - 100, 100));
        assert!(le(0, 0));
        assert!(ge(0, u32::MAX));
    }

    #[test]
    fn diff_is_signed() {
        assert_eq!(diff(105, 100), 5);
        assert_eq!(diff(100, 105), -5);
        assert_eq!(diff(50, u32::MAX - 49), 100);
    }

    proptest! {
        // Adding the same offset to both arguments never changes an ordering,
        // which is the mod-2^32 invariance the arithmetic promises.
        #[test]
        fn invariant_under_translation(a: u32, b: u32, shift: u32) {
            prop_assert_eq!(lt(a, b), lt(a.wrapping_add(shift), b.wrapping_add(shift)));
            prop_assert_eq!(le(a, b), le(a.wrapping_add(shift), b.wrapping_add(shift)));
        }

        #[test]
        fn add_then_diff_roundtrips(a: u32, n in 0u32..i32::MAX as u32) {
            prop_assert_eq!(diff(add(a, n), a), n as i32);
        }
    }
}
