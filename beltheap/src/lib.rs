//! A segmented copying heap organized as belts.
//!
//! The heap is one contiguous mapping divided into belts, youngest
//! first. Mutators bump-allocate into the young belt through per-thread
//! TLABs; a collection promotes the live cells of a belt into its elder
//! neighbor and resets the evacuated belt to empty. Elder-to-young
//! references are found through a card table, and a side table keeps
//! every belt linearly parseable in fixed-size blocks so cards can be
//! scanned and parallel workers can claim scan work.
//!
//! The embedding runtime describes its cells with an [`ObjectModel`]
//! (size and trace functions over raw [`Address`]es) and exposes its
//! roots through [`RootProvider`]. Each mutator thread holds a
//! [`HeapProxy`] and polls [`HeapProxy::safepoint`] at loop edges so a
//! collecting thread can stop the world.

pub mod address;
pub mod barrier;
pub mod belt;
pub mod card;
pub mod evacuate;
pub mod heap;
pub mod manager;
pub mod object;
pub mod safepoint;
pub mod settings;
pub mod side;
pub mod system;

mod collector;
mod verify;

#[cfg(test)]
pub(crate) mod testlayout;

pub use address::{Address, WORD_SIZE};
pub use heap::{GcHook, GcStats, Heap, HeapProxy};
pub use object::{CellFlags, HEADER_SIZE, Header, ObjectModel, RootProvider, SizeFn, TraceFn};
pub use settings::HeapSettings;
