// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use mycelium_bitfield::bitfield;

bitfield! {
    /// A 64-bit indexed pointer into the global link pool.
    ///
    /// `LinkRef`s are plain values, never owning handles. The null `LinkRef`
    /// has index 0, which the pool never hands out.
    #[derive(Eq, PartialEq)]
    pub struct LinkRef<u64> {
        /// Index into the global link pool; index 0 is reserved as null.
        pub const INDEX = 26;
        /// Recycle counter advanced on every reuse of the slot, so a stale
        /// `LinkRef` never compares equal to the slot's current one.
        pub const COUNTER = ..;
    }
}

// === impl LinkRef ===

impl LinkRef {
    pub const NULL: Self = Self::from_bits(0);

    /// Number of values the 38-bit counter can take before wrapping.
    pub const COUNTER_PERIOD: u64 = 1 << (64 - 26);

    #[must_use]
    pub fn new_indexed(index: u32, counter: u64) -> Self {
        Self::new()
            .with(Self::INDEX, u64::from(index))
            .with(Self::COUNTER, counter % Self::COUNTER_PERIOD)
    }

    /// The raw 64-bit encoding, as stored in atomic list heads.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.get(Self::INDEX) == 0
    }

    #[must_use]
    pub fn index(self) -> u32 {
        // INDEX is 26 bits wide, always in range for u32
        u32::try_from(self.get(Self::INDEX)).unwrap_or(0)
    }

    #[must_use]
    pub fn counter(self) -> u64 {
        self.get(Self::COUNTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_has_index_zero() {
        assert!(LinkRef::NULL.is_null());
        assert_eq!(LinkRef::NULL.raw(), 0);
        assert!(!LinkRef::new_indexed(1, 0).is_null());
    }

    #[test]
    fn round_trips_index_and_counter() {
        let r = LinkRef::new_indexed(0x3FF_FFFF, 0x3F_FFFF_FFFF);
        assert_eq!(r.index(), 0x3FF_FFFF);
        assert_eq!(r.counter(), 0x3F_FFFF_FFFF);
    }

    #[test]
    fn counter_wraps_into_its_field() {
        let r = LinkRef::new_indexed(7, LinkRef::COUNTER_PERIOD + 3);
        assert_eq!(r.index(), 7);
        assert_eq!(r.counter(), 3);
    }

    #[test]
    fn same_index_different_counter_are_unequal() {
        let a = LinkRef::new_indexed(42, 1);
        let b = LinkRef::new_indexed(42, 2);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }
}
