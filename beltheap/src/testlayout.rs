//! Test-only object layout shared by the collector tests.
//!
//! A test cell is laid out as:
//!
//! ```text
//! [ Header ][ ref_count ][ ref 0 .. ref n-1 ][ raw payload .. ]
//! ```
//!
//! The header carries the full cell size, so the default header-based
//! size function applies.

use crate::address::{Address, WORD_SIZE};
use crate::object::{HEADER_SIZE, Header, ObjectModel};

const REF_COUNT_OFFSET: usize = HEADER_SIZE;
const REFS_OFFSET: usize = REF_COUNT_OFFSET + WORD_SIZE;

/// Byte size of a cell with `ref_count` references and `raw_words` extra
/// payload words.
pub fn cell_size(ref_count: usize, raw_words: usize) -> usize {
    REFS_OFFSET + (ref_count + raw_words) * WORD_SIZE
}

/// Installs a cell of `size` bytes at `at` holding `refs`.
pub fn write_cell(at: Address, size: usize, refs: &[Address]) {
    assert!(size >= cell_size(refs.len(), 0));
    // SAFETY: test memory owned by the caller
    unsafe {
        Header::install(at, size);
        at.plus(REF_COUNT_OFFSET).write_word(refs.len());
        for (i, r) in refs.iter().enumerate() {
            at.plus(REFS_OFFSET + i * WORD_SIZE).write_word(r.raw());
        }
    }
}

pub fn ref_count(cell: Address) -> usize {
    // SAFETY: cell written by write_cell
    unsafe { cell.plus(REF_COUNT_OFFSET).read_word() }
}

pub fn get_ref(cell: Address, i: usize) -> Address {
    assert!(i < ref_count(cell));
    // SAFETY: cell written by write_cell
    Address::new(unsafe { cell.plus(REFS_OFFSET + i * WORD_SIZE).read_word() })
}

/// Address of the i-th reference slot, for write-barrier calls.
pub fn ref_slot(cell: Address, i: usize) -> Address {
    cell.plus(REFS_OFFSET + i * WORD_SIZE)
}

pub fn set_ref(cell: Address, i: usize, to: Address) {
    assert!(i < ref_count(cell));
    // SAFETY: cell written by write_cell
    unsafe { cell.plus(REFS_OFFSET + i * WORD_SIZE).write_word(to.raw()) }
}

/// Trace function for test cells.
///
/// # Safety
/// `cell` must have been written by [`write_cell`].
pub unsafe fn trace_cell(cell: Address, visitor: &mut dyn FnMut(&mut Address)) {
    // SAFETY: layout per contract
    unsafe {
        let count = cell.plus(REF_COUNT_OFFSET).read_word();
        for i in 0..count {
            let slot = cell.plus(REFS_OFFSET + i * WORD_SIZE).raw() as *mut Address;
            visitor(&mut *slot);
        }
    }
}

pub fn model() -> ObjectModel {
    ObjectModel::with_header_sizes(trace_cell)
}
