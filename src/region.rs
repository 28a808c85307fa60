use std::{mem, ptr::NonNull};

use log::{debug, warn};

use crate::{
    block::{Tag, TagLayout},
    error::{BreakError, InitError, ShrinkError},
    kernel::ProgramBreak,
    utils::padding_for,
};

/// The managed heap: one contiguous region taken from a [`ProgramBreak`] and
/// tiled by blocks with no gaps between them.
///
/// ```text
///  heap start                                                      heap end
///      |                                                               |
///      v                                                               v
///      +-----+---------+-----+-----+-------------+-----+-----+----+-----+
///      | Hdr | payload | Ftr | Hdr |   payload   | Ftr | Hdr | .. | Ftr |
///      +-----+---------+-----+-----+-------------+-----+-----+----+-----+
///      <------ block ------->  <-------- block -------->
/// ```
///
/// Blocks are never referenced by pointer. Every position inside the heap is a
/// byte offset from the heap start and the only place raw memory is touched is
/// [`Heap::tag`] / [`Heap::set_tag`], which check the offset against the
/// current heap end first.
pub(crate) struct Heap<B: ProgramBreak> {
    /// Where the memory comes from.
    brk: B,
    /// Start of the heap, aligned to `alignment`. Never changes.
    base: NonNull<u8>,
    /// Bytes skipped before `base` to align it. Released along with the heap.
    padding: usize,
    /// Offset of the heap end, which is also the heap size.
    end: usize,
    /// Payload of allocated blocks plus the tags of every block.
    pub(crate) allocated: usize,
    alignment: usize,
    pub(crate) tags: TagLayout,
}

impl<B: ProgramBreak> Heap<B> {
    /// Takes `size` bytes (already validated and aligned) from `brk` and lays
    /// them out as a single free block. A `size` of zero creates an empty heap.
    pub(crate) fn new(mut brk: B, alignment: usize, size: usize) -> Result<Self, InitError> {
        let tags = TagLayout::new(alignment);

        let start = brk.current()?;
        let padding = padding_for(start.as_ptr() as usize, alignment);
        let delta = isize::try_from(padding + size).map_err(|_| BreakError::OutOfMemory)?;

        // SAFETY: growing the break releases nothing.
        let previous = unsafe { brk.adjust(delta)? };
        if previous != start {
            // Somebody moved the break between both calls. Give back what we took.
            if let Err(err) = unsafe { brk.adjust(-delta) } {
                warn!("could not give back {} bytes to the program break: {}", delta, err);
            }
            return Err(BreakError::Discontiguous.into());
        }

        // SAFETY: the break guarantees `padding + size` valid bytes from `start`.
        let base = unsafe { start.add(padding) };

        let mut heap = Self { brk, base, padding, end: size, allocated: 0, alignment, tags };

        if size != 0 {
            debug_assert!(size >= tags.overhead() + alignment);
            let segment = size - tags.overhead();
            heap.set_block(0, segment, true);
            heap.allocated = tags.overhead();
        }

        debug!("heap created at {:?} with {} bytes ({} of padding)", base, size, padding);

        Ok(heap)
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Heap size in bytes, which is also the offset of the heap end.
    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub(crate) fn alignment(&self) -> usize {
        self.alignment
    }

    /// Address of the payload of the block at `header`.
    pub(crate) fn payload(&self, header: usize) -> NonNull<u8> {
        debug_assert!(self.tags.payload(header) < self.end);

        // SAFETY: headers are always followed by their payload inside the heap.
        unsafe { self.base.add(self.tags.payload(header)) }
    }

    /// Address right after the last block.
    fn end_addr(&self) -> usize {
        self.base.as_ptr() as usize + self.end
    }

    /// Reads the tag at offset `at`.
    ///
    /// Panics if the tag does not lie entirely inside the heap. That can only
    /// be the consequence of corrupted metadata or a bug in the allocator.
    pub(crate) fn tag(&self, at: usize) -> Tag {
        self.assert_in_bounds(at);

        // SAFETY: bounds are checked above and the whole heap is valid memory.
        unsafe { self.base.as_ptr().add(at).cast::<Tag>().read_unaligned() }
    }

    pub(crate) fn set_tag(&mut self, at: usize, tag: Tag) {
        self.assert_in_bounds(at);

        // SAFETY: same as `tag`.
        unsafe { self.base.as_ptr().add(at).cast::<Tag>().write_unaligned(tag) }
    }

    fn assert_in_bounds(&self, at: usize) {
        assert!(
            at.checked_add(mem::size_of::<Tag>()).is_some_and(|end| end <= self.end),
            "tag access at offset {at:#x} outside of the heap (size {:#x})",
            self.end,
        );
    }

    /// Writes matching header and footer tags for a block of `size` bytes of
    /// payload starting at `header`.
    pub(crate) fn set_block(&mut self, header: usize, size: usize, free: bool) {
        self.set_tag(header, Tag::header(size, free));
        self.set_tag(self.tags.footer(header, size), Tag::footer(size, free));
    }

    /// Flips the free flag on both tags of the block at `header` and returns
    /// its payload size.
    pub(crate) fn mark(&mut self, header: usize, free: bool) -> usize {
        let tag = self.tag(header);
        let footer = self.tags.footer(header, tag.size);

        self.set_tag(header, tag.with_free(free));
        self.set_tag(footer, self.tag(footer).with_free(free));

        tag.size
    }

    /// Asks the program break for `amount` more bytes and installs them as a
    /// new free block at the old heap end, returning its header.
    ///
    /// `amount` must cover both tags of the new block and be aligned; callers
    /// request the payload they need plus [`TagLayout::overhead`].
    pub(crate) fn grow(&mut self, amount: usize) -> Result<usize, BreakError> {
        debug_assert!(amount >= self.tags.overhead());
        debug_assert_eq!(amount % self.alignment, 0);

        let delta = isize::try_from(amount).map_err(|_| BreakError::OutOfMemory)?;

        // SAFETY: growing the break releases nothing.
        let previous = unsafe { self.brk.adjust(delta)? };

        if previous.as_ptr() as usize != self.end_addr() {
            // The break moved under us, the new bytes are not adjacent to the
            // heap so they can't be used.
            if let Err(err) = unsafe { self.brk.adjust(-delta) } {
                warn!("could not give back {} bytes to the program break: {}", amount, err);
            }
            warn!("program break moved by someone else, refusing to grow the heap");
            return Err(BreakError::Discontiguous);
        }

        let header = self.end;
        self.end += amount;
        self.set_block(header, amount - self.tags.overhead(), true);
        self.allocated += self.tags.overhead();

        debug!("heap grew by {} bytes to {}", amount, self.end);

        Ok(header)
    }

    /// Returns exactly `amount` bytes from the tail of the heap to the program
    /// break. Every block overlapping those bytes must be free.
    ///
    /// If the bytes end in the middle of a block, that block keeps its header
    /// and shrinks to what is left of it.
    pub(crate) fn shrink(&mut self, amount: usize) -> Result<(), ShrinkError> {
        if amount == 0 {
            return Ok(());
        }

        if amount % self.alignment != 0 {
            return Err(ShrinkError::Misaligned { amount, alignment: self.alignment });
        }

        if amount > self.end {
            return Err(ShrinkError::ExceedsHeap);
        }

        // Walk backwards from the last block until the freed bytes add up.
        let mut block_end = self.end;
        let mut total = 0;
        let mut consumed = 0;

        let boundary = loop {
            if block_end == 0 {
                return Err(ShrinkError::ExceedsHeap);
            }

            let footer = self.tag(block_end - self.tags.size());
            if !footer.is_free() {
                return Err(ShrinkError::InUse);
            }

            let header = block_end - self.tags.overhead() - footer.size;
            total += footer.size + self.tags.overhead();

            if total >= amount {
                break header;
            }

            consumed += 1;
            block_end = header;
        };

        let overshoot = total - amount;
        if overshoot != 0 && overshoot < self.tags.overhead() + self.alignment {
            return Err(ShrinkError::SplitsBlock);
        }

        if self.brk.current()?.as_ptr() as usize != self.end_addr() {
            return Err(BreakError::Discontiguous.into());
        }

        let delta = isize::try_from(amount).map_err(|_| ShrinkError::ExceedsHeap)?;

        // SAFETY: the bytes released belong to free blocks of this heap and
        // the break sits right at the heap end.
        unsafe { self.brk.adjust(-delta)? };

        self.end -= amount;

        if overshoot == 0 {
            consumed += 1;
            self.allocated -= consumed * self.tags.overhead();
        } else {
            self.allocated -= consumed * self.tags.overhead();
            self.set_block(boundary, overshoot - self.tags.overhead(), true);
            let merged = self.merge(boundary);
            debug_assert!(merged.is_some());
        }

        debug!("heap shrunk by {} bytes to {}", amount, self.end);

        Ok(())
    }

    /// Tries to merge the given free block at `header` with the previous one.
    /// This can be performed if that previous block is free as well.
    pub(crate) fn merge_with_prev(&mut self, header: &mut usize) {
        if *header == 0 {
            return;
        }

        let prev_footer = *header - self.tags.size();
        let prev = self.tag(prev_footer);

        if prev.is_free() {
            let size = self.tag(*header).size;
            let prev_header = self.tags.header(prev_footer, prev.size);

            // The previous block swallows our header and the previous footer.
            self.set_block(prev_header, prev.size + self.tags.overhead() + size, true);
            self.allocated -= self.tags.overhead();

            // The current block is now its previous one
            *header = prev_header;
        }
    }

    /// Tries to merge the given free block at `header` with the next one. This
    /// can be performed if that next block is free as well.
    pub(crate) fn merge_with_next(&mut self, header: usize) {
        let size = self.tag(header).size;
        let next_header = self.tags.next(header, size);

        if next_header == self.end {
            return;
        }

        let next = self.tag(next_header);
        if next.is_free() {
            self.set_block(header, size + self.tags.overhead() + next.size, true);
            self.allocated -= self.tags.overhead();
        }
    }

    /// Merges the free block at `header` with its free neighbours and returns
    /// the header of the resulting block, which moves back if the previous
    /// block was absorbed.
    ///
    /// Returns `None` if `header` is not the header of a free block.
    pub(crate) fn merge(&mut self, header: usize) -> Option<usize> {
        let tag = self.tag(header);
        if !tag.is_header() || !tag.is_free() {
            return None;
        }

        let mut header = header;
        self.merge_with_prev(&mut header);
        self.merge_with_next(header);

        Some(header)
    }
}

impl<B: ProgramBreak> Drop for Heap<B> {
    fn drop(&mut self) {
        let total = self.padding + self.end;

        let Ok(delta) = isize::try_from(total) else {
            return;
        };

        match self.brk.current() {
            Ok(current) if current.as_ptr() as usize == self.end_addr() => {
                // SAFETY: every byte between the original break and the heap
                // end is ours, and nothing references the heap anymore.
                match unsafe { self.brk.adjust(-delta) } {
                    Ok(_) => debug!("released {} bytes of heap", total),
                    Err(err) => warn!("could not release {} bytes of heap: {}", total, err),
                }
            }
            _ => warn!("program break moved past the heap, leaking {} bytes", total),
        }
    }
}
