use std::{
    cell::{Cell, RefCell},
    ptr::NonNull,
    rc::Rc,
    sync::{Mutex, MutexGuard},
};

use tagheap::{
    AllocError, Allocator, BreakError, Config, FixedBreak, FreeError, ProgramBreak, ShrinkError,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the tests can see and control of a [`RecordingBreak`] after it has
/// been moved into an allocator.
#[derive(Default)]
struct Probe {
    /// Every non zero delta requested, in order.
    moves: RefCell<Vec<isize>>,
    /// Refuse to grow while set.
    exhausted: Cell<bool>,
    /// Bytes "somebody else" takes from the break before the next call.
    foreign: Cell<isize>,
    /// Bytes below the break after the last call.
    used: Cell<usize>,
}

impl Probe {
    fn grows(&self) -> Vec<isize> {
        self.moves.borrow().iter().copied().filter(|delta| *delta > 0).collect()
    }

    fn last_move(&self) -> Option<isize> {
        self.moves.borrow().last().copied()
    }
}

struct RecordingBreak {
    inner: FixedBreak,
    probe: Rc<Probe>,
}

impl RecordingBreak {
    fn new(capacity: usize) -> (Self, Rc<Probe>) {
        let probe = Rc::new(Probe::default());
        let brk = Self { inner: FixedBreak::new(capacity).unwrap(), probe: Rc::clone(&probe) };
        (brk, probe)
    }
}

unsafe impl ProgramBreak for RecordingBreak {
    unsafe fn adjust(&mut self, delta: isize) -> Result<NonNull<u8>, BreakError> {
        let foreign = self.probe.foreign.replace(0);
        if foreign != 0 {
            unsafe { self.inner.adjust(foreign)? };
        }

        if delta != 0 {
            self.probe.moves.borrow_mut().push(delta);

            if delta > 0 && self.probe.exhausted.get() {
                return Err(BreakError::OutOfMemory);
            }
        }

        let previous = unsafe { self.inner.adjust(delta) };
        self.probe.used.set(self.inner.used());
        previous
    }
}

fn allocator(initial_size: usize) -> (Allocator<RecordingBreak>, Rc<Probe>) {
    let (brk, probe) = RecordingBreak::new(1 << 20);
    let allocator = Allocator::with_break(Config::new(16, initial_size), brk).unwrap();
    (allocator, probe)
}

/// Sum of every block with its tags, which must add up to the heap size.
fn tiled_size(allocator: &Allocator<RecordingBreak>) -> usize {
    let t = allocator.tag_size();
    allocator.blocks().map(|block| block.size + 2 * t).sum()
}

#[test]
fn freed_block_is_reused_without_growing() {
    let _serial = serial();
    let (brk, probe) = RecordingBreak::new(1 << 20);
    // Tags are 16 bytes with an alignment of 16.
    let t = 16;
    let mut allocator = Allocator::with_break(Config::new(16, 128 + 2 * t), brk).unwrap();
    assert_eq!(allocator.tag_size(), t);

    let a = allocator.allocate(32).unwrap();
    let b = allocator.allocate(32).unwrap();
    let c = allocator.allocate(32).unwrap();
    allocator.deallocate(b.as_ptr()).unwrap();

    let grows = probe.grows().len();
    let d = allocator.allocate(16).unwrap();

    assert_eq!(d, b);
    assert_eq!(probe.grows().len(), grows);
    assert_ne!(d, a);
    assert_ne!(d, c);
    assert_eq!(allocator.check(), Ok(()));
}

#[test]
fn growth_requests_payload_plus_tags() {
    let _serial = serial();
    let (mut allocator, probe) = allocator(256);
    let t = allocator.tag_size() as isize;

    // Fill the initial block completely.
    allocator.allocate(256 - 2 * t as usize).unwrap();
    let size = allocator.heap_size();
    let grows = probe.grows();

    allocator.allocate(64).unwrap();

    let mut expected = grows.clone();
    expected.push(64 + 2 * t);
    assert_eq!(probe.grows(), expected);
    assert_eq!(allocator.heap_size(), size + 64 + 2 * t as usize);
    assert_eq!(allocator.check(), Ok(()));
}

#[test]
fn shrink_returns_exact_amount() {
    let _serial = serial();
    let (mut allocator, probe) = allocator(0);
    let t = allocator.tag_size();

    let a = allocator.allocate(32).unwrap();
    let b = allocator.allocate(48).unwrap();
    let c = allocator.allocate(64).unwrap();
    let size = allocator.heap_size();

    // `b` and `c` occupy the last k bytes.
    let k = (48 + 2 * t) + (64 + 2 * t);
    assert_eq!(allocator.shrink(k), Err(ShrinkError::InUse));

    allocator.deallocate(c.as_ptr()).unwrap();
    assert_eq!(allocator.shrink(k), Err(ShrinkError::InUse));
    assert_eq!(allocator.heap_size(), size);

    allocator.deallocate(b.as_ptr()).unwrap();
    allocator.shrink(k).unwrap();

    assert_eq!(allocator.heap_size(), size - k);
    assert_eq!(probe.last_move(), Some(-(k as isize)));
    assert_eq!(probe.used.get(), size - k);
    assert_eq!(allocator.memory_allocated(), 32 + 2 * t);
    assert_eq!(tiled_size(&allocator), allocator.heap_size());

    allocator.deallocate(a.as_ptr()).unwrap();
    assert_eq!(allocator.check(), Ok(()));
}

#[test]
fn shrink_into_free_block_keeps_the_rest() {
    let _serial = serial();
    let (mut allocator, _probe) = allocator(1024);
    let t = allocator.tag_size();

    let a = allocator.allocate(64).unwrap();
    let size = allocator.heap_size();

    allocator.shrink(512).unwrap();

    assert_eq!(allocator.heap_size(), size - 512);
    let blocks: Vec<_> = allocator.blocks().map(|block| (block.size, block.free)).collect();
    assert_eq!(blocks, vec![(64, false), (1024 - 4 * t - 64 - 512, true)]);
    assert_eq!(allocator.check(), Ok(()));

    assert_eq!(
        allocator.shrink(8),
        Err(ShrinkError::Misaligned { amount: 8, alignment: 16 })
    );
    assert_eq!(allocator.shrink(size), Err(ShrinkError::ExceedsHeap));

    allocator.deallocate(a.as_ptr()).unwrap();
}

#[test]
fn out_of_memory_leaves_heap_usable() {
    let _serial = serial();
    let (mut allocator, probe) = allocator(128);

    let a = allocator.allocate(64).unwrap();
    let size = allocator.heap_size();
    let used = allocator.memory_allocated();

    probe.exhausted.set(true);
    assert_eq!(
        allocator.allocate(1024),
        Err(AllocError::OutOfMemory(BreakError::OutOfMemory))
    );
    assert_eq!(allocator.heap_size(), size);
    assert_eq!(allocator.memory_allocated(), used);
    assert_eq!(allocator.check(), Ok(()));

    probe.exhausted.set(false);
    let b = allocator.allocate(1024).unwrap();

    allocator.deallocate(a.as_ptr()).unwrap();
    allocator.deallocate(b.as_ptr()).unwrap();
    assert_eq!(allocator.check(), Ok(()));
}

#[test]
fn foreign_break_move_is_detected() {
    let _serial = serial();
    let (mut allocator, probe) = allocator(128);
    let size = allocator.heap_size();

    probe.foreign.set(4096);
    assert_eq!(
        allocator.allocate(1024),
        Err(AllocError::OutOfMemory(BreakError::Discontiguous))
    );
    assert_eq!(allocator.heap_size(), size);
    assert_eq!(probe.used.get(), size + 4096);
    assert_eq!(allocator.check(), Ok(()));

    // The break no longer sits at the heap end, so nothing can be returned.
    assert_eq!(allocator.shrink(16), Err(ShrinkError::Break(BreakError::Discontiguous)));

    drop(allocator);
    assert_eq!(probe.used.get(), size + 4096);
}

#[test]
fn drop_releases_the_heap() {
    let _serial = serial();
    let (mut allocator, probe) = allocator(4096);

    allocator.allocate(100).unwrap();
    allocator.allocate(5000).unwrap();
    let size = allocator.heap_size();
    assert!(tagheap::active());

    drop(allocator);

    assert!(!tagheap::active());
    assert_eq!(probe.used.get(), 0);
    assert_eq!(probe.last_move(), Some(-(size as isize)));
}

#[test]
fn unaligned_break_is_padded_and_released() {
    let _serial = serial();
    let (mut brk, probe) = RecordingBreak::new(1 << 20);
    let origin = brk.current().unwrap().as_ptr() as usize;
    unsafe { brk.adjust(8) }.unwrap();

    let mut allocator = Allocator::with_break(Config::new(16, 256), brk).unwrap();
    let start = allocator.heap_start().as_ptr() as usize;
    assert_eq!(start % 16, 0);
    assert_eq!(start, origin + 16);
    assert_eq!(probe.used.get(), 16 + 256);

    let a = allocator.allocate(100).unwrap();
    assert_eq!(a.as_ptr() as usize % 16, 0);
    allocator.deallocate(a.as_ptr()).unwrap();
    assert_eq!(allocator.check(), Ok(()));

    drop(allocator);

    // Padding and heap go back, the bytes taken before stay.
    assert_eq!(probe.last_move(), Some(-(8 + 256)));
    assert_eq!(probe.used.get(), 8);
}

#[test]
fn double_free_is_reported() {
    let _serial = serial();
    let (mut allocator, _probe) = allocator(4096);

    let a = allocator.allocate(10).unwrap();
    allocator.deallocate(a.as_ptr()).unwrap();

    assert_eq!(allocator.deallocate(a.as_ptr()), Err(FreeError::DoubleFree(a.as_ptr() as usize)));
}

/// Small deterministic generator so the workload is the same on every run.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Allocates and frees random sizes, verifying the heap after every step,
/// then frees everything and gives the whole heap back.
fn mixed_workload(alignment: usize, initial_size: usize, rounds: u32) {
    let _serial = serial();
    let (brk, _probe) = RecordingBreak::new(16 << 20);
    let mut allocator = Allocator::with_break(Config::new(alignment, initial_size), brk).unwrap();
    let mut rng = Lcg(0x5eed ^ alignment as u64);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..rounds {
        if live.is_empty() || rng.next() % 3 != 0 {
            let size = 1 + (rng.next() % 700) as usize;
            let fill = (round % 251) as u8;
            let ptr = allocator.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);

            unsafe { ptr.as_ptr().write_bytes(fill, size) };
            live.push((ptr, size, fill));
        } else {
            let (ptr, size, fill) = live.swap_remove(rng.next() as usize % live.len());

            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|byte| *byte == fill), "payload overwritten");

            allocator.deallocate(ptr.as_ptr()).unwrap();
        }

        assert_eq!(allocator.check(), Ok(()));
        assert_eq!(tiled_size(&allocator), allocator.heap_size());
        assert!(allocator.memory_allocated() <= allocator.heap_size());
    }

    for (ptr, _, _) in live.drain(..) {
        allocator.deallocate(ptr.as_ptr()).unwrap();
    }

    // Everything merged back into a single free block.
    let blocks: Vec<_> = allocator.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0].free);
    assert_eq!(allocator.memory_allocated(), 2 * allocator.tag_size());

    let size = allocator.heap_size();
    allocator.shrink(size).unwrap();
    assert_eq!(allocator.heap_size(), 0);
    assert_eq!(allocator.memory_allocated(), 0);
}

#[test]
fn invariants_hold_through_mixed_workload() {
    mixed_workload(16, 2048, 2000);
}

#[test]
fn invariants_hold_with_tags_wider_than_alignment() {
    mixed_workload(8, 2048, 2000);
}

#[test]
fn invariants_hold_with_page_alignment() {
    mixed_workload(4096, 0, 300);
}
