//! The narrow interface between the collector and the object model.
//!
//! The collector does not know object formats. It requires exactly three
//! things of every cell: the cell starts with a [`Header`] (size word plus
//! forwarding word), its size is available through the model's size
//! function, and its embedded references can be enumerated in place through
//! the model's [`TraceFn`]. Everything else about layout stays on the
//! runtime's side of this boundary.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::address::{Address, WORD_SIZE};

/// Function that reports the byte size of the cell at `cell`.
///
/// # Safety
/// `cell` must point at a valid, live cell.
pub type SizeFn = unsafe fn(cell: Address) -> usize;

/// Function that visits every embedded reference word of the cell at `cell`.
///
/// The visitor receives each reference slot as `&mut Address` so the
/// collector can update it in place when the target moves. Zero slots must
/// be passed through untouched by the caller's visitor contract.
///
/// # Safety
/// `cell` must point at a valid, live cell of the traced format.
pub type TraceFn = unsafe fn(cell: Address, visitor: &mut dyn FnMut(&mut Address));

/// Consumers implement this to expose GC roots.
///
/// Called when a thread parks at a safepoint and again when it resumes, so
/// the collector can rewrite root slots in place after relocation.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Address));
}

/// The object-model functions a heap is constructed with.
#[derive(Clone, Copy)]
pub struct ObjectModel {
    pub size_of: SizeFn,
    pub trace: TraceFn,
}

impl ObjectModel {
    /// Model for runtimes that keep the cell size in the header word, which
    /// is what the built-in [`Header`] provides.
    pub fn with_header_sizes(trace: TraceFn) -> Self {
        Self {
            size_of: header_size_of,
            trace,
        }
    }
}

/// Size function reading the built-in header's size word.
///
/// # Safety
/// `cell` must point at a cell that starts with a [`Header`].
pub unsafe fn header_size_of(cell: Address) -> usize {
    // SAFETY: valid per contract
    unsafe { Header::at(cell) }.size()
}

bitflags::bitflags! {
    /// Flag bits packed into the low bits of the header's size word.
    /// Cell sizes are word multiples, so the low bits are free.
    pub struct CellFlags: usize {
        /// Dead cell plugging a retired TLAB tail or an alignment gap.
        const FILLER = 1 << 0;
    }
}

pub const HEADER_SIZE: usize = size_of::<Header>();

/// Word planted in front of every directly-allocated cell in debug builds.
/// A linear walk that sees this word skips it; a verifier that expects it
/// and finds something else aborts.
pub const DEBUG_TAG: usize = 0xDEB7_A66E_DEB7_A66E_u64 as usize;

/// The two-word header at the start of every heap cell.
///
/// ```text
/// word 0: cell size in bytes (header included); low bit set ⇒ filler
/// word 1: forwarding address, 0 while the cell has not been evacuated
/// ```
///
/// The forwarding word is the single source of truth for "has this cell
/// already been copied this cycle": it is installed at most once, by plain
/// store in the sequential evacuator and by compare-and-swap in the
/// parallel one, and never changes afterwards.
#[repr(C)]
pub struct Header {
    size_and_flags: usize,
    forward: AtomicUsize,
}

const _: () = assert!(size_of::<Header>() == 2 * WORD_SIZE);

impl Header {
    /// Borrows the header embedded at `cell`.
    ///
    /// # Safety
    /// `cell` must point at mapped memory holding an installed header.
    #[inline(always)]
    pub unsafe fn at<'a>(cell: Address) -> &'a Header {
        debug_assert!(cell.is_aligned(WORD_SIZE));
        // SAFETY: valid per contract
        unsafe { &*(cell.raw() as *const Header) }
    }

    /// Writes a fresh header for a `size`-byte cell at `cell`.
    ///
    /// # Safety
    /// `cell..cell+size` must be exclusively owned mapped memory.
    #[inline]
    pub unsafe fn install(cell: Address, size: usize) {
        debug_assert!(size >= HEADER_SIZE && size.is_multiple_of(WORD_SIZE));
        let header = cell.raw() as *mut Header;
        // SAFETY: exclusively owned per contract
        unsafe {
            (*header).size_and_flags = size;
            (*header).forward = AtomicUsize::new(0);
        }
    }

    /// Writes a filler header covering `size` dead bytes at `cell`, keeping
    /// the region parseable by linear walks. A one-word filler carries only
    /// the size word; walks never read a filler's forwarding word.
    ///
    /// # Safety
    /// Same as [`Header::install`].
    #[inline]
    pub unsafe fn install_filler(cell: Address, size: usize) {
        debug_assert!(size >= WORD_SIZE && size.is_multiple_of(WORD_SIZE));
        // SAFETY: exclusively owned per contract
        unsafe {
            cell.write_word(size | CellFlags::FILLER.bits());
            if size >= HEADER_SIZE {
                cell.plus(WORD_SIZE).write_word(0);
            }
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size_and_flags & !CellFlags::all().bits()
    }

    #[inline(always)]
    pub fn flags(&self) -> CellFlags {
        CellFlags::from_bits_truncate(self.size_and_flags)
    }

    #[inline(always)]
    pub fn is_filler(&self) -> bool {
        self.flags().contains(CellFlags::FILLER)
    }

    /// Reads the forwarding reference; zero means not evacuated.
    #[inline(always)]
    pub fn forwarding(&self) -> Address {
        Address::new(self.forward.load(Ordering::Acquire))
    }

    /// Installs the forwarding reference unconditionally (sequential
    /// evacuator, sole owner of the cycle).
    #[inline(always)]
    pub fn set_forwarding(&self, to: Address) {
        debug_assert!(self.forwarding().is_zero(), "forwarding set twice");
        self.forward.store(to.raw(), Ordering::Release);
    }

    /// Attempts to claim the evacuation of this cell by installing `to`.
    /// The first caller wins; losers get the winner's address back.
    #[inline(always)]
    pub fn claim_forwarding(&self, to: Address) -> Result<(), Address> {
        match self.forward.compare_exchange(
            0,
            to.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(winner) => Err(Address::new(winner)),
        }
    }
}

/// Copies a cell's bytes from `src` to `dst`.
///
/// # Safety
/// Both ranges must be mapped and must not overlap.
#[inline]
pub unsafe fn copy_cell(src: Address, dst: Address, size: usize) {
    // SAFETY: disjoint mapped ranges per contract
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_cell(words: usize) -> (Vec<usize>, Address) {
        let buf = vec![0usize; words];
        let addr = Address::new(buf.as_ptr() as usize);
        (buf, addr)
    }

    #[test]
    fn install_and_read_back() {
        let (_buf, cell) = scratch_cell(8);
        // SAFETY: scratch buffer owned by the test
        unsafe { Header::install(cell, 64) };
        // SAFETY: header installed above
        let header = unsafe { Header::at(cell) };
        assert_eq!(header.size(), 64);
        assert!(!header.is_filler());
        assert!(header.forwarding().is_zero());
    }

    #[test]
    fn filler_is_flagged_but_sized() {
        let (_buf, cell) = scratch_cell(8);
        // SAFETY: scratch buffer owned by the test
        unsafe { Header::install_filler(cell, 48) };
        // SAFETY: header installed above
        let header = unsafe { Header::at(cell) };
        assert_eq!(header.size(), 48);
        assert!(header.is_filler());
    }

    #[test]
    fn claim_forwarding_has_exactly_one_winner() {
        let (_buf, cell) = scratch_cell(8);
        // SAFETY: scratch buffer owned by the test
        unsafe { Header::install(cell, 64) };
        // SAFETY: header installed above
        let header = unsafe { Header::at(cell) };

        let first = Address::new(0x8000);
        let second = Address::new(0x9000);
        assert_eq!(header.claim_forwarding(first), Ok(()));
        assert_eq!(header.claim_forwarding(second), Err(first));
        assert_eq!(header.forwarding(), first);
    }

    #[test]
    fn concurrent_claims_agree_on_one_address() {
        use std::sync::Arc;

        let buf = Arc::new(vec![0usize; 8]);
        let cell = Address::new(buf.as_ptr() as usize);
        // SAFETY: scratch buffer owned by the test
        unsafe { Header::install(cell, 64) };

        let threads = 8;
        let mut handles = Vec::new();
        for t in 0..threads {
            let buf = buf.clone();
            handles.push(std::thread::spawn(move || {
                let cell = Address::new(buf.as_ptr() as usize);
                // SAFETY: header installed before spawn
                let header = unsafe { Header::at(cell) };
                let mine = Address::new(0x1000 * (t + 1));
                match header.claim_forwarding(mine) {
                    Ok(()) => mine,
                    Err(winner) => winner,
                }
            }));
        }
        let results: Vec<Address> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = results[0];
        assert!(results.iter().all(|&r| r == first));
    }
}
