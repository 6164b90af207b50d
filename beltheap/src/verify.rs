//! Opt-in heap consistency check, run in the cycle prologue and epilogue
//! while the world is frozen.
//!
//! The check walks every belt's allocated region linearly. Outside of an
//! evacuation no cell may carry a forwarding pointer, every size must be
//! plausible, and every reference must land in the allocated region of
//! some belt. Enabled through [`HeapSettings::verify`]; a violation dumps
//! diagnostics and aborts.
//!
//! [`HeapSettings::verify`]: crate::settings::HeapSettings

use log::{debug, error};

use crate::address::Address;
use crate::evacuate::walk_cells;
use crate::heap::HeapInner;
use crate::object::{HEADER_SIZE, Header};

pub(crate) fn verify_heap(heap: &HeapInner) {
    debug!("verifying heap");
    let mut cells = 0usize;
    for belt in heap.manager.belts() {
        if belt.used() == 0 {
            continue;
        }
        let view = belt.view_allocated();
        // SAFETY: the world is frozen and retired TLAB tails are filled,
        // so the allocated region is a parseable run
        unsafe {
            walk_cells(view, &heap.model, &mut |cell| {
                verify_cell(heap, cell);
                cells += 1;
            });
        }
    }
    debug!("verified {cells} cells");
}

fn verify_cell(heap: &HeapInner, cell: Address) {
    // SAFETY: walk_cells hands out live cells
    let header = unsafe { Header::at(cell) };

    let forwarded = header.forwarding();
    if !forwarded.is_zero() {
        fail(heap, cell, &format!("stale forwarding to {forwarded}"));
    }
    let size = header.size();
    if size < HEADER_SIZE || cell.plus(size) > heap.heap_end() {
        fail(heap, cell, &format!("implausible size {size}"));
    }

    let trace = heap.model.trace;
    // SAFETY: live cell of the configured model
    unsafe {
        trace(cell, &mut |slot| {
            let reference = *slot;
            if reference.is_zero() {
                return;
            }
            let allocated = heap
                .manager
                .belt_containing(reference)
                .is_some_and(|b| reference < b.mark());
            if !allocated {
                fail(heap, cell, &format!("dangling reference {reference}"));
            }
        });
    }
}

fn fail(heap: &HeapInner, cell: Address, what: &str) -> ! {
    error!("cell {cell}: {what}");
    heap.print_diagnostics();
    panic!("heap verification failed");
}
