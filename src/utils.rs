//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.


/// It aligns `to_be_aligned` using `aligment`, returning `None` if the result
/// does not fit in a `usize`.
///
/// `aligment` must be a power of two. This is used to round every segment size
/// the allocator hands out to a multiple of the heap alignment, and to size the
/// boundary tags themselves.
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    debug_assert!(aligment.is_power_of_two());
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|padded| padded & !(aligment - 1))
}

/// Number of bytes needed to move `addr` up to the next multiple of `aligment`.
pub fn padding_for(addr: usize, aligment: usize) -> usize {
    (aligment - addr % aligment) % aligment
}
