//! # tagheap - a boundary tag heap allocator
//!
//! This crate manages one contiguous heap taken from the program break
//! (`sbrk(2)` on unix) without relying on the platform allocator. Every block
//! of the heap is bracketed by a header and a footer tag recording its size and
//! whether it is free:
//!
//! ```text
//! +-----+---------+-----+-----+--------------+-----+-----+------+-----+
//! | Hdr | payload | Ftr | Hdr |   payload    | Ftr | Hdr | free | Ftr |
//! +-----+---------+-----+-----+--------------+-----+-----+------+-----+
//! ^                                                                   ^
//! heap start                                           program break
//! ```
//!
//! - Allocation is first fit: blocks are scanned from the heap start and the
//!   first free one that is large enough is split to the requested size.
//! - If nothing fits the break is moved up and the new bytes become a block.
//! - Freed blocks are merged with free neighbours right away, which the footer
//!   tags make possible in both directions.
//! - [`Allocator::shrink`] gives free bytes at the end of the heap back.
//!
//! ## Quick Start
//!
//! ```rust
//! use tagheap::{Allocator, Config, FixedBreak};
//!
//! let brk = FixedBreak::new(64 * 1024).unwrap();
//! let mut allocator = Allocator::with_break(Config::default(), brk).unwrap();
//!
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe { ptr.as_ptr().write_bytes(0, 100) };
//!
//! allocator.deallocate(ptr.as_ptr()).unwrap();
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: only one [`Allocator`] may be alive in the
//!   process at a time and it is neither `Send` nor `Sync`.
//! - **One alignment**: every block is aligned to [`Config::alignment`].
//! - **No realloc**.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, trace, warn};

mod block;
pub mod config;
pub mod error;
pub mod kernel;
mod list;
mod region;
mod split;
mod utils;

pub use config::Config;
pub use error::{AllocError, BreakError, ConfigError, FreeError, HeapError, InitError, ShrinkError};
pub use kernel::{FixedBreak, ProgramBreak};
pub use list::BlockInfo;

#[cfg(unix)]
pub use kernel::Sbrk;

#[cfg(windows)]
pub use kernel::VirtualBreak;

use crate::{region::Heap, utils::align};

/// Set while an [`Allocator`] is alive.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Tells whether an [`Allocator`] is currently alive in this process.
pub fn active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Proof that the holder is the only allocator alive. Dropping it lets the
/// next one be created.
struct ActiveToken(());

impl ActiveToken {
    fn acquire() -> Result<Self, InitError> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(()))
            .map_err(|_| InitError::AlreadyActive)
    }
}

impl Drop for ActiveToken {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

/// The allocator. It owns the heap and the [`ProgramBreak`] the heap lives on.
///
/// Dropping it gives the whole heap back to the break, so every pointer it
/// handed out becomes dangling.
pub struct Allocator<B: ProgramBreak> {
    heap: Heap<B>,
    // Declared last so that it is released after the heap.
    _active: ActiveToken,
}

#[cfg(unix)]
impl Allocator<Sbrk> {
    /// Creates an allocator on the process program break.
    pub fn new(config: Config) -> Result<Self, InitError> {
        Self::with_break(config, Sbrk)
    }
}

impl<B: ProgramBreak> Allocator<B> {
    /// Creates an allocator whose heap lives on `brk`. The heap starts as a
    /// single free block of [`Config::initial_size`] bytes.
    ///
    /// Fails with [`InitError::AlreadyActive`] if another allocator is alive.
    pub fn with_break(config: Config, brk: B) -> Result<Self, InitError> {
        let size = config.validate()?;
        let active = ActiveToken::acquire()?;
        let heap = Heap::new(brk, config.alignment, size)?;

        Ok(Self { heap, _active: active })
    }

    /// Allocates a block of at least `bytes` bytes and returns a pointer to its
    /// payload, aligned to [`Config::alignment`].
    ///
    /// `bytes` is rounded up to the alignment. If no free block fits, the heap
    /// grows by exactly the rounded size plus the two tags of a block.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroSize);
        }

        let size = align(bytes, self.heap.alignment())
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or(AllocError::TooLarge(bytes))?;

        let header = match self.heap.first_fit(size) {
            Some(header) => header,
            None => {
                let amount = size
                    .checked_add(self.heap.tags.overhead())
                    .ok_or(AllocError::TooLarge(bytes))?;

                let header = self.heap.grow(amount).map_err(|err| {
                    warn!("allocation of {} bytes failed: {}", bytes, err);
                    AllocError::OutOfMemory(err)
                })?;

                // The last block may have been free but too small.
                self.heap.merge(header).ok_or(AllocError::Corrupted)?
            }
        };

        let header = self.heap.split(header, size).ok_or(AllocError::Corrupted)?;

        // The block may be slightly larger than `size` when splitting it would
        // have left a remainder too small to be a block.
        let size = self.heap.mark(header, false);
        self.heap.allocated += size;

        let ptr = self.heap.payload(header);
        trace!("allocate({}) -> {:?}", bytes, ptr);

        Ok(ptr)
    }

    /// Frees the block whose payload starts at `ptr`.
    ///
    /// Errors mean the caller handed in something that is not a live
    /// allocation of this heap. The heap is left untouched, but the caller's
    /// state is most likely corrupted and aborting is usually the only safe
    /// reaction.
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        let header = self
            .find_block(ptr)
            .inspect_err(|err| warn!("invalid free: {}", err))?;

        let size = self.heap.mark(header, true);
        self.heap.allocated -= size;
        self.heap.merge(header).ok_or(FreeError::Corrupted)?;

        trace!("deallocate({:?})", ptr);

        Ok(())
    }

    /// Finds the header of the allocated block whose payload starts at `ptr`.
    fn find_block(&self, ptr: *mut u8) -> Result<usize, FreeError> {
        if ptr.is_null() {
            return Err(FreeError::Null);
        }

        let addr = ptr as usize;
        let tags = self.heap.tags;

        let offset = addr
            .checked_sub(self.heap.base().as_ptr() as usize)
            .filter(|offset| *offset >= tags.size() && *offset < self.heap.end())
            .ok_or(FreeError::OutOfBounds(addr))?;

        let header = offset - tags.size();
        if header % self.heap.alignment() != 0 {
            return Err(FreeError::NotABlock(addr));
        }

        let tag = self.heap.tag(header);
        if !tag.is_header() {
            return Err(FreeError::NotABlock(addr));
        }
        // Checked before the footer: a block merged into its predecessor keeps
        // its stale header, marked free, in the middle of the merged payload.
        if tag.is_free() {
            return Err(FreeError::DoubleFree(addr));
        }

        // The size comes from memory we do not trust yet.
        let footer = offset
            .checked_add(tag.size)
            .filter(|footer| footer.checked_add(tags.size()).is_some_and(|end| end <= self.heap.end()))
            .ok_or(FreeError::NotABlock(addr))?;

        if self.heap.tag(footer) != block::Tag::footer(tag.size, false) {
            return Err(FreeError::NotABlock(addr));
        }

        Ok(header)
    }

    /// Gives `amount` bytes from the end of the heap back to the program
    /// break. Every block overlapping those bytes must be free and `amount`
    /// must be a multiple of the alignment.
    pub fn shrink(&mut self, amount: usize) -> Result<(), ShrinkError> {
        self.heap
            .shrink(amount)
            .inspect_err(|err| debug!("could not shrink heap by {} bytes: {}", amount, err))
    }

    /// Bytes currently managed by the heap, tags included.
    pub fn heap_size(&self) -> usize {
        self.heap.end()
    }

    /// Bytes in use: the payload of allocated blocks plus the tags of every
    /// block. Never larger than [`Allocator::heap_size`].
    pub fn memory_allocated(&self) -> usize {
        self.heap.allocated
    }

    pub fn alignment(&self) -> usize {
        self.heap.alignment()
    }

    /// Bytes taken by a single tag. Every block costs two of them.
    pub fn tag_size(&self) -> usize {
        self.heap.tags.size()
    }

    /// First byte of the heap. Block offsets are relative to it.
    pub fn heap_start(&self) -> NonNull<u8> {
        self.heap.base()
    }

    /// Blocks of the heap in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.heap.blocks()
    }

    /// Walks the whole heap verifying its invariants.
    pub fn check(&self) -> Result<(), HeapError> {
        self.heap.check()
    }
}
