use std::fmt;

/// Machine word size in bytes; every cell size and mark is a multiple of it.
pub const WORD_SIZE: usize = size_of::<usize>();

/// A raw address into the managed heap.
///
/// All belt bookkeeping (marks, bounds, card/chunk indices) is plain address
/// arithmetic over this wrapper. The zero address doubles as the failure
/// value of the allocation paths, so `0` is never a valid cell address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline(always)]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn plus(self, bytes: usize) -> Self {
        debug_assert!(!self.is_zero(), "offsetting the zero address");
        Self(self.0 + bytes)
    }

    #[inline(always)]
    pub fn minus(self, bytes: usize) -> Self {
        debug_assert!(self.0 >= bytes, "address underflow");
        Self(self.0 - bytes)
    }

    /// Byte distance from `base` to `self`; `self` must not precede `base`.
    #[inline(always)]
    pub fn offset_from(self, base: Self) -> usize {
        debug_assert!(self.0 >= base.0, "offset_from a later address");
        self.0 - base.0
    }

    #[inline(always)]
    pub fn align_up(self, alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self((self.0 + alignment - 1) & !(alignment - 1))
    }

    #[inline(always)]
    pub fn is_aligned(self, alignment: usize) -> bool {
        debug_assert!(alignment.is_power_of_two());
        self.0.is_multiple_of(alignment)
    }

    #[inline(always)]
    pub const fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    #[inline(always)]
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Reads the word stored at this address.
    ///
    /// # Safety
    /// The address must be valid, word-aligned mapped memory.
    #[inline(always)]
    pub unsafe fn read_word(self) -> usize {
        debug_assert!(self.is_aligned(WORD_SIZE));
        // SAFETY: valid per contract
        unsafe { *(self.0 as *const usize) }
    }

    /// Writes a word to this address.
    ///
    /// # Safety
    /// The address must be valid, word-aligned mapped memory.
    #[inline(always)]
    pub unsafe fn write_word(self, word: usize) {
        debug_assert!(self.is_aligned(WORD_SIZE));
        // SAFETY: valid per contract
        unsafe { *(self.0 as *mut usize) = word }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_round_trips() {
        let a = Address::new(0x1000);
        assert_eq!(a.plus(0x200).raw(), 0x1200);
        assert_eq!(a.plus(0x200).minus(0x200), a);
        assert_eq!(a.plus(24).offset_from(a), 24);
    }

    #[test]
    fn alignment_helpers() {
        let a = Address::new(0x1001);
        assert_eq!(a.align_up(512).raw(), 0x1200);
        assert!(Address::new(0x1200).is_aligned(512));
        assert!(!a.is_aligned(8));
    }

    #[test]
    fn zero_is_distinguished() {
        assert!(Address::zero().is_zero());
        assert!(!Address::new(8).is_zero());
    }
}
