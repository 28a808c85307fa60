use std::alloc::LayoutError;

use thiserror::Error;

/// Failures of a [`crate::kernel::ProgramBreak`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("program break cannot move below its origin")]
    Underflow,
    #[error("program break was moved by another owner")]
    Discontiguous,
    #[error("invalid arena layout: {0}")]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("alignment {0} is not a power of two in 1..=4096")]
    Alignment(usize),
    #[error("initial size {size} cannot hold a block, at least {min} bytes are needed")]
    InitialSizeTooSmall { size: usize, min: usize },
    #[error("initial size {0} is too large")]
    InitialSizeTooLarge(usize),
}

/// Failures while constructing an [`crate::Allocator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("another allocator is already active")]
    AlreadyActive,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not obtain the initial heap: {0}")]
    Break(#[from] BreakError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("zero sized allocations are not supported")]
    ZeroSize,
    #[error("allocation of {0} bytes is too large")]
    TooLarge(usize),
    #[error("heap could not grow: {0}")]
    OutOfMemory(#[source] BreakError),
    #[error("heap metadata is corrupted")]
    Corrupted,
}

/// Invalid frees. The heap is left untouched when one of these is returned,
/// but the caller's own state can no longer be trusted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FreeError {
    #[error("attempted to free a null pointer")]
    Null,
    #[error("pointer {0:#x} is outside of the heap")]
    OutOfBounds(usize),
    #[error("pointer {0:#x} is not the start of a block")]
    NotABlock(usize),
    #[error("double free of pointer {0:#x}")]
    DoubleFree(usize),
    #[error("heap metadata is corrupted")]
    Corrupted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShrinkError {
    #[error("shrink amount {amount} is not a multiple of the alignment {alignment}")]
    Misaligned { amount: usize, alignment: usize },
    #[error("trailing bytes of the heap are still allocated")]
    InUse,
    #[error("shrink amount exceeds the heap size")]
    ExceedsHeap,
    #[error("shrink would leave a block too small to hold its tags")]
    SplitsBlock,
    #[error(transparent)]
    Break(#[from] BreakError),
}

/// Broken invariants found by [`crate::Allocator::check`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("block at offset {offset:#x}: {reason}")]
    Block { offset: usize, reason: &'static str },
    #[error("trailing bytes at offset {found:#x} do not form a block, the heap ends at {expected:#x}")]
    Tiling { expected: usize, found: usize },
    #[error("memory accounted as allocated is {found}, blocks add up to {expected}")]
    Accounting { expected: usize, found: usize },
}
