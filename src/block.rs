use std::mem;
use crate::utils::align;


/// Flag bit set when the block is available.
const FREE: usize = 1 << 0;
/// Flag bit set on header tags, clear on footers.
const HEADER: usize = 1 << 1;

/// This is the boundary tag. Every block carries two of them, a header right
/// before the payload and a footer right after it, both holding the same size
/// and free status:
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Header tag
/// | flags: free|header  |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> `size` bytes of payload
/// |         ...         |        |
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        | -> Footer tag
/// | flags: free         |        |
/// +---------------------+ <------+
/// ```
///
/// Having the footer lets us find the previous block in constant time, which is
/// all the coalescer needs to merge in both directions without any list.
///
/// Tags are read back from arbitrary heap bytes, for instance when validating
/// a pointer given to `deallocate`, which with alignments below the tag size
/// can straddle two real tags. So every byte of a `Tag` must be initialized
/// when written and any byte pattern must be a valid `Tag`: flags live in a
/// whole word instead of two `bool`s and the struct has no padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Tag {
    /// Payload size of the block, tags excluded.
    pub size: usize,
    flags: usize,
}

const _: () = assert!(mem::size_of::<Tag>() == 2 * mem::size_of::<usize>());

impl Tag {
    pub const fn header(size: usize, free: bool) -> Self {
        Self { size, flags: HEADER | if free { FREE } else { 0 } }
    }

    pub const fn footer(size: usize, free: bool) -> Self {
        Self { size, flags: if free { FREE } else { 0 } }
    }

    #[inline]
    pub const fn is_free(&self) -> bool {
        self.flags & FREE != 0
    }

    #[inline]
    pub const fn is_header(&self) -> bool {
        self.flags & HEADER != 0
    }

    /// The same tag with its free flag set to `free`.
    #[inline]
    pub const fn with_free(self, free: bool) -> Self {
        let flags = if free { self.flags | FREE } else { self.flags & !FREE };
        Self { size: self.size, flags }
    }
}

/// Offset arithmetic between the tags of a block. Every offset here is relative
/// to the heap start.
///
/// The tag stride is `size_of::<Tag>()` rounded up to the heap alignment so that
/// payloads stay aligned and `2 * size` is itself a multiple of the alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TagLayout {
    size: usize,
}

impl TagLayout {
    /// `alignment` must be a power of two no larger than the one validated by
    /// [`crate::Config::validate`].
    pub fn new(alignment: usize) -> Self {
        let raw = mem::size_of::<Tag>();
        Self { size: align(raw, alignment).unwrap_or(raw) }
    }

    /// Bytes taken by one tag.
    #[inline]
    pub const fn size(self) -> usize {
        self.size
    }

    /// Bytes taken by the header and the footer of a block.
    #[inline]
    pub const fn overhead(self) -> usize {
        2 * self.size
    }

    #[inline]
    pub const fn footer(self, header: usize, size: usize) -> usize {
        header + self.size + size
    }

    #[inline]
    pub const fn header(self, footer: usize, size: usize) -> usize {
        footer - size - self.size
    }

    /// Header of the block that follows. For the last block this is the heap end.
    #[inline]
    pub const fn next(self, header: usize, size: usize) -> usize {
        header + self.size + size + self.size
    }

    #[inline]
    pub const fn payload(self, header: usize) -> usize {
        header + self.size
    }
}
