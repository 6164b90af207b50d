//! Multi-threaded allocation and collection stress driver.
//!
//! Each worker thread churns through linked lists of small cells: most
//! allocations die young, a configurable fraction is kept reachable
//! through a list head, and a long-lived sentinel cell periodically has
//! the current head stored into it so elder-to-young references and the
//! write barrier get exercised. Run with `RUST_LOG=info` (or `debug`)
//! for per-cycle output.

use std::sync::Arc;

use clap::Parser as ClapParser;
use log::info;

use beltheap::barrier::SenseBarrier;
use beltheap::{
    Address, HEADER_SIZE, Header, Heap, HeapProxy, HeapSettings, ObjectModel,
    RootProvider, WORD_SIZE,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Heap size in megabytes
    #[arg(long, default_value_t = 64)]
    heap_mb: usize,

    /// Number of mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Allocations per mutator thread
    #[arg(long, default_value_t = 200_000)]
    iterations: usize,

    /// Payload words per cell
    #[arg(long, default_value_t = 6)]
    payload_words: usize,

    /// Keep every nth allocation reachable through the list head
    #[arg(long, default_value_t = 16)]
    keep_every: usize,

    /// Drop the whole list once it reaches this length
    #[arg(long, default_value_t = 512)]
    list_limit: usize,

    /// Store the list head into the sentinel every nth allocation
    #[arg(long, default_value_t = 1024)]
    mutate_every: usize,

    /// Collector worker threads for parallel cycles
    #[arg(long, default_value_t = 2)]
    gc_threads: usize,

    /// Evacuate with a single linear pass instead of parallel workers
    #[arg(long)]
    sequential: bool,

    /// Run the heap consistency check around every cycle
    #[arg(long)]
    verify: bool,
}

// cell layout: [header][next reference][payload words]
const NEXT_OFFSET: usize = HEADER_SIZE;

fn cell_size(payload_words: usize) -> usize {
    HEADER_SIZE + WORD_SIZE + payload_words * WORD_SIZE
}

/// # Safety
/// `cell` must be a live cell of the layout above.
unsafe fn trace_list_cell(cell: Address, visitor: &mut dyn FnMut(&mut Address)) {
    let slot = cell.plus(NEXT_OFFSET).as_mut_ptr() as *mut Address;
    // SAFETY: the next slot is in bounds for the layout
    unsafe { visitor(&mut *slot) };
}

fn write_next(cell: Address, next: Address) {
    // SAFETY: the next slot is in bounds for the layout
    unsafe { cell.plus(NEXT_OFFSET).write_word(next.raw()) };
}

fn read_next(cell: Address) -> Address {
    // SAFETY: the next slot is in bounds for the layout
    Address::new(unsafe { cell.plus(NEXT_OFFSET).read_word() })
}

struct WorkerRoots {
    head: Address,
    sentinel: Address,
}

impl RootProvider for WorkerRoots {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Address)) {
        visitor(&mut self.head);
        visitor(&mut self.sentinel);
    }
}

fn run_worker(cli: &Cli, mut proxy: HeapProxy, t: usize) -> usize {
    let size = cell_size(cli.payload_words);
    let mut roots = WorkerRoots {
        head: Address::zero(),
        sentinel: Address::zero(),
    };

    let sentinel = proxy.allocate(size, &mut roots);
    // SAFETY: freshly allocated, exclusively owned
    unsafe { Header::install(sentinel, size) };
    write_next(sentinel, Address::zero());
    roots.sentinel = sentinel;

    let mut list_len = 0usize;
    let mut kept = 0usize;
    for i in 0..cli.iterations {
        let cell = proxy.allocate(size, &mut roots);
        // SAFETY: freshly allocated, exclusively owned
        unsafe { Header::install(cell, size) };
        write_next(cell, Address::zero());
        for w in 0..cli.payload_words {
            // SAFETY: payload words are in bounds for the layout
            unsafe {
                cell.plus(NEXT_OFFSET + WORD_SIZE + w * WORD_SIZE)
                    .write_word(t ^ i ^ w)
            };
        }

        if cli.keep_every > 0 && i % cli.keep_every == 0 {
            write_next(cell, roots.head);
            roots.head = cell;
            list_len += 1;
            kept += 1;
            if list_len >= cli.list_limit {
                roots.head = Address::zero();
                list_len = 0;
            }
        }

        if cli.mutate_every > 0 && i % cli.mutate_every == 0 {
            write_next(roots.sentinel, roots.head);
            proxy.write_barrier(roots.sentinel.plus(NEXT_OFFSET));
        }

        proxy.safepoint(&mut roots);
    }

    // the surviving list must still be intact
    let mut walked = 0usize;
    let mut cursor = roots.head;
    while !cursor.is_zero() {
        // SAFETY: rooted cells are live
        assert_eq!(unsafe { Header::at(cursor) }.size(), size);
        cursor = read_next(cursor);
        walked += 1;
    }
    assert_eq!(walked, list_len);
    kept
}

fn main() {
    env_logger::init();
    let cli = Arc::new(Cli::parse());

    let settings = HeapSettings {
        heap_size: cli.heap_mb << 20,
        gc_threads: cli.gc_threads,
        parallel: !cli.sequential,
        verify: cli.verify,
        ..HeapSettings::default()
    };
    let heap = Heap::new(settings, ObjectModel::with_header_sizes(trace_list_cell))
        .expect("heap construction failed");

    heap.add_post_gc_hook(Box::new(|stats| {
        info!(
            "cycle {} done: {} cells copied so far, last pause {:.2?}",
            stats.collections, stats.copied_cells, stats.last_pause
        );
    }));

    let barrier = Arc::new(SenseBarrier::new());
    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..cli.threads)
        .map(|t| {
            let cli = cli.clone();
            let heap = heap.clone();
            let barrier = barrier.clone();
            std::thread::Builder::new()
                .name(format!("mutator-{t}"))
                .spawn(move || {
                    // line up before registering so no thread sleeps here
                    // while holding a proxy
                    barrier.wait(cli.threads);
                    let proxy = heap.proxy();
                    run_worker(&cli, proxy, t)
                })
                .expect("failed to spawn mutator")
        })
        .collect();

    let mut kept = 0usize;
    for handle in handles {
        kept += handle.join().expect("mutator panicked");
    }
    let elapsed = started.elapsed();

    let stats = heap.stats();
    println!(
        "{} threads x {} allocations ({} kept) in {:.2?}",
        cli.threads, cli.iterations, kept, elapsed
    );
    println!(
        "{} collections ({} major), {} cells / {} bytes copied",
        stats.collections, stats.major_collections, stats.copied_cells, stats.copied_bytes
    );
    println!(
        "pauses: {:.2?} total, {:.2?} last",
        stats.total_pause, stats.last_pause
    );
    heap.print_diagnostics();
}
