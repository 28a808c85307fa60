use crate::{error::HeapError, kernel::ProgramBreak, region::Heap};


/// A block as seen from the outside: where its header is and what its tags say.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the heap start.
    pub offset: usize,
    /// Payload size in bytes.
    pub size: usize,
    pub free: bool,
}

/// Walks the blocks of a [`Heap`] from the heap start to the heap end by
/// jumping from header to header. There is no list to maintain, the sizes in
/// the headers are the links:
///
/// ```text
///      +--------------------+   +---------------+   +--------+
///      |                    v   |               v   |        v
/// +-----+---------+-----+-----+-------+-----+-----+----+-----+
/// | Hdr |   ...   | Ftr | Hdr |  ...  | Ftr | Hdr | .. | Ftr | end
/// +-----+---------+-----+-----+-------+-----+-----+----+-----+
/// ```
pub(crate) struct Blocks<'a, B: ProgramBreak> {
    heap: &'a Heap<B>,
    current: usize,
}

impl<'a, B: ProgramBreak> Iterator for Blocks<'a, B> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.heap.end() {
            return None;
        }

        let tag = self.heap.tag(self.current);
        let block = BlockInfo { offset: self.current, size: tag.size, free: tag.is_free() };

        self.current = self.heap.tags.next(self.current, tag.size);

        Some(block)
    }
}

impl<B: ProgramBreak> Heap<B> {
    pub(crate) fn blocks(&self) -> Blocks<'_, B> {
        Blocks { heap: self, current: 0 }
    }

    /// Returns the header of the first free block that can hold `size` bytes.
    ///
    /// This is the first-fit algorithm: blocks are scanned in address order
    /// starting at the heap start and the first one that fits is taken, even
    /// if a better one comes after it.
    pub(crate) fn first_fit(&self, size: usize) -> Option<usize> {
        self.blocks()
            .find(|block| block.free && block.size >= size)
            .map(|block| block.offset)
    }

    /// Verifies every heap invariant: tags of each block agree, blocks tile the
    /// heap exactly, sizes are aligned and the allocated byte count matches
    /// what the blocks say.
    pub(crate) fn check(&self) -> Result<(), HeapError> {
        let tags = self.tags;
        let mut header = 0;
        let mut expected = 0;

        while header < self.end() {
            let fail = |reason| Err(HeapError::Block { offset: header, reason });

            if self.end() - header < tags.overhead() {
                return Err(HeapError::Tiling { expected: self.end(), found: header });
            }

            let tag = self.tag(header);
            if !tag.is_header() {
                return fail("header tag is not marked as a header");
            }
            if tag.size % self.alignment() != 0 {
                return fail("size is not a multiple of the alignment");
            }

            let next = match header
                .checked_add(tags.overhead())
                .and_then(|end| end.checked_add(tag.size))
            {
                Some(next) if next <= self.end() => next,
                _ => return fail("extends past the heap end"),
            };

            let footer = self.tag(tags.footer(header, tag.size));
            if footer.is_header() {
                return fail("footer tag is marked as a header");
            }
            if footer.size != tag.size || footer.is_free() != tag.is_free() {
                return fail("header and footer disagree");
            }

            expected += tags.overhead();
            if !tag.is_free() {
                expected += tag.size;
            }

            header = next;
        }

        if expected != self.allocated {
            return Err(HeapError::Accounting { expected, found: self.allocated });
        }

        Ok(())
    }
}
