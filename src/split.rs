use crate::{block::Tag, kernel::ProgramBreak, region::Heap};

impl<B: ProgramBreak> Heap<B> {
    /// Splits the block at `header` so that it holds exactly `size` bytes of
    /// payload, turning the rest into a new free block right after it:
    ///
    /// ```text
    /// Before:
    /// +-----+------------------------------------------+-----+
    /// | Hdr |                 payload                  | Ftr |
    /// +-----+------------------------------------------+-----+
    ///
    /// After:
    /// +-----+----------+-----+-----+-------------------+-----+
    /// | Hdr |   size   | Ftr | Hdr | remainder (free)  | Ftr |
    /// +-----+----------+-----+-----+-------------------+-----+
    /// ```
    ///
    /// If the remainder could not hold its own tags plus one aligned unit of
    /// payload the block is left whole and returned as is.
    ///
    /// Returns `None` if `header` is not a header or the block is smaller than
    /// `size`.
    pub(crate) fn split(&mut self, header: usize, size: usize) -> Option<usize> {
        let tag = self.tag(header);
        if !tag.is_header() || size > tag.size {
            return None;
        }

        let rest = tag.size - size;
        if rest < self.tags.overhead() + self.alignment() {
            return Some(header);
        }

        let footer = self.tags.footer(header, size);
        self.set_tag(footer, Tag::footer(size, tag.is_free()));

        let remainder = footer + self.tags.size();
        self.set_block(remainder, rest - self.tags.overhead(), true);

        self.set_tag(header, Tag::header(size, tag.is_free()));
        self.allocated += self.tags.overhead();

        Some(header)
    }
}


#[cfg(test)]
mod tests {
    use crate::{block::Tag, kernel::FixedBreak, region::Heap};

    const T: usize = 16;

    fn heap(size: usize) -> Heap<FixedBreak> {
        Heap::new(FixedBreak::new(4096).unwrap(), 16, size).unwrap()
    }

    #[test]
    fn split_carves_exact_block_and_free_remainder() {
        let mut heap = heap(160);

        assert_eq!(heap.split(0, 32), Some(0));

        assert_eq!(heap.tag(0), Tag::header(32, true));
        assert_eq!(heap.tag(T + 32), Tag::footer(32, true));

        let remainder = 32 + 2 * T;
        assert_eq!(heap.tag(remainder), Tag::header(128 - 32 - 2 * T, true));
        assert_eq!(heap.tag(160 - T), Tag::footer(128 - 32 - 2 * T, true));
        assert_eq!(heap.allocated, 4 * T);
    }

    #[test]
    fn split_keeps_free_state_of_first_block() {
        let mut heap = heap(160);
        heap.mark(0, false);

        heap.split(0, 16).unwrap();

        assert_eq!(heap.tag(0), Tag::header(16, false));
        assert_eq!(heap.tag(T + 16), Tag::footer(16, false));
        assert!(heap.tag(16 + 2 * T).is_free());
    }

    #[test]
    fn split_to_same_size_is_noop() {
        let mut heap = heap(160);

        assert_eq!(heap.split(0, 128), Some(0));
        assert_eq!(heap.tag(0), Tag::header(128, true));
        assert_eq!(heap.allocated, 2 * T);
    }

    #[test]
    fn split_without_room_for_remainder_is_noop() {
        let mut heap = heap(160);

        // 128 - 96 = 32 bytes left, just the two tags of an empty block.
        assert_eq!(heap.split(0, 96), Some(0));
        assert_eq!(heap.tag(0), Tag::header(128, true));
        assert_eq!(heap.allocated, 2 * T);

        // 128 - 80 = 48 bytes left, enough for tags and 16 bytes of payload.
        assert_eq!(heap.split(0, 80), Some(0));
        assert_eq!(heap.tag(80 + 2 * T), Tag::header(16, true));
    }

    #[test]
    fn split_rejects_oversized_request_and_footers() {
        let mut heap = heap(160);

        assert_eq!(heap.split(0, 144), None);
        assert_eq!(heap.split(T + 128, 16), None);
        assert_eq!(heap.tag(0), Tag::header(128, true));
    }

    #[test]
    fn merge_undoes_split() {
        let mut heap = heap(160);

        let header = heap.split(0, 48).unwrap();
        assert_eq!(heap.merge(header), Some(0));

        assert_eq!(heap.tag(0), Tag::header(128, true));
        assert_eq!(heap.tag(T + 128), Tag::footer(128, true));
        assert_eq!(heap.allocated, 2 * T);
    }
}
