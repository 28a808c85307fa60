use std::{alloc::{self, Layout}, ptr::NonNull};
use crate::{config::MAX_ALIGNMENT, error::BreakError};

/// This trait provides an abstraction over the program break, the boundary
/// that marks where the memory of the heap ends. As the allocator, our top
/// level view of this has nothing to do with the concrete implementations /
/// APIs offered by each kernel, all we need is to move the boundary by a
/// signed amount of bytes.
///
/// ```text
/// +-------------------------+
/// |          Stack          |
/// +-------------------------+
/// |                         |
/// +-------------------------+ <- program break (adjust(+n) moves it up)
/// |          Heap           |
/// +-------------------------+ <- heap start
/// ```
///
/// # Safety
///
/// Implementations must guarantee that after a successful `adjust(delta)` with
/// `delta >= 0` the returned pointer (the previous break) is valid for reads
/// and writes of `delta` bytes, and that memory below the break stays valid
/// until the break is moved below it.
pub unsafe trait ProgramBreak {
    /// Moves the break by `delta` bytes and returns the previous break.
    ///
    /// # Safety
    ///
    /// A negative `delta` releases the memory between the new and the old
    /// break. The caller must own that memory and must not touch it again.
    unsafe fn adjust(&mut self, delta: isize) -> Result<NonNull<u8>, BreakError>;

    /// Returns the current break without moving it.
    fn current(&mut self) -> Result<NonNull<u8>, BreakError> {
        // SAFETY: a zero delta releases nothing.
        unsafe { self.adjust(0) }
    }
}

/// A program break backed by a fixed-capacity arena owned by this struct.
///
/// The break starts at the beginning of the arena and can never go past
/// `capacity`, which makes out of memory conditions deterministic. It is
/// what the tests run on and what embedders use when they want a bounded heap
/// that does not touch the process break.
pub struct FixedBreak {
    memory: NonNull<u8>,
    layout: Layout,
    brk: usize,
}

impl FixedBreak {
    /// Creates an arena of `capacity` bytes aligned to [`MAX_ALIGNMENT`].
    pub fn new(capacity: usize) -> Result<Self, BreakError> {
        let layout = Layout::from_size_align(capacity.max(1), MAX_ALIGNMENT)?;

        // SAFETY: `layout` has a non zero size.
        let memory = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(BreakError::OutOfMemory)?;

        Ok(Self { memory, layout, brk: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes currently below the break.
    pub fn used(&self) -> usize {
        self.brk
    }
}

unsafe impl ProgramBreak for FixedBreak {
    unsafe fn adjust(&mut self, delta: isize) -> Result<NonNull<u8>, BreakError> {
        let brk = match self.brk.checked_add_signed(delta) {
            Some(brk) if brk <= self.capacity() => brk,
            _ if delta < 0 => return Err(BreakError::Underflow),
            _ => return Err(BreakError::OutOfMemory),
        };

        // SAFETY: `self.brk <= capacity`, so the pointer stays inside the arena
        // or one past its end.
        let previous = unsafe { self.memory.add(self.brk) };
        self.brk = brk;

        Ok(previous)
    }
}

impl Drop for FixedBreak {
    fn drop(&mut self) {
        // SAFETY: `memory` was allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.memory.as_ptr(), self.layout) }
    }
}

#[cfg(unix)]
pub use self::unix::Sbrk;

#[cfg(windows)]
pub use self::windows::VirtualBreak;

#[cfg(unix)]
mod unix {
    use super::ProgramBreak;
    use crate::error::BreakError;

    use libc::{c_void, intptr_t, sbrk};

    use std::ptr::NonNull;

    /// The real program break of the process, moved with `sbrk(2)`.
    ///
    /// There is only one break per process, and anything else calling `sbrk`
    /// (the platform allocator included) moves it too. The heap detects that
    /// and refuses to grow into memory it does not own.
    #[derive(Debug, Default)]
    pub struct Sbrk;

    unsafe impl ProgramBreak for Sbrk {
        unsafe fn adjust(&mut self, delta: isize) -> Result<NonNull<u8>, BreakError> {
            unsafe {
                let previous = sbrk(delta as intptr_t);

                if previous == usize::MAX as *mut c_void {
                    return Err(BreakError::OutOfMemory);
                }

                NonNull::new(previous.cast::<u8>()).ok_or(BreakError::OutOfMemory)
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::ProgramBreak;
    use crate::{error::BreakError, utils::align};

    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    /// Windows has no program break, so we emulate one: a range of address
    /// space is reserved up front and pages are committed and decommitted as
    /// the break moves inside of it.
    pub struct VirtualBreak {
        base: NonNull<u8>,
        reserved: usize,
        committed: usize,
        brk: usize,
        page_size: usize,
    }

    impl VirtualBreak {
        /// Reserves `capacity` bytes of address space. Nothing is committed yet.
        pub fn reserve(capacity: usize) -> Result<Self, BreakError> {
            let page_size = unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            };

            let reserved = align(capacity, page_size).ok_or(BreakError::OutOfMemory)?;

            let addr = unsafe {
                Memory::VirtualAlloc(None, reserved, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS)
            };
            let base = NonNull::new(addr.cast::<u8>()).ok_or(BreakError::OutOfMemory)?;

            Ok(Self { base, reserved, committed: 0, brk: 0, page_size })
        }

        fn commit(&mut self, brk: usize) -> Result<(), BreakError> {
            let target = align(brk, self.page_size).ok_or(BreakError::OutOfMemory)?;

            unsafe {
                let start = self.base.as_ptr().add(self.committed);
                let addr = Memory::VirtualAlloc(
                    Some(start as *const c_void),
                    target - self.committed,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                if addr.is_null() {
                    return Err(BreakError::OutOfMemory);
                }
            }

            self.committed = target;
            Ok(())
        }

        fn decommit(&mut self, brk: usize) {
            let Some(keep) = align(brk, self.page_size) else {
                return;
            };

            if keep < self.committed {
                unsafe {
                    let start = self.base.as_ptr().add(keep);
                    let released = Memory::VirtualFree(
                        start as *mut c_void,
                        self.committed - keep,
                        Memory::MEM_DECOMMIT,
                    );

                    if released.is_ok() {
                        self.committed = keep;
                    }
                }
            }
        }
    }

    unsafe impl ProgramBreak for VirtualBreak {
        unsafe fn adjust(&mut self, delta: isize) -> Result<NonNull<u8>, BreakError> {
            let brk = match self.brk.checked_add_signed(delta) {
                Some(brk) if brk <= self.reserved => brk,
                _ if delta < 0 => return Err(BreakError::Underflow),
                _ => return Err(BreakError::OutOfMemory),
            };

            if brk > self.committed {
                self.commit(brk)?;
            } else {
                self.decommit(brk);
            }

            let previous = unsafe { self.base.add(self.brk) };
            self.brk = brk;

            Ok(previous)
        }
    }

    impl Drop for VirtualBreak {
        fn drop(&mut self) {
            unsafe {
                let _ = Memory::VirtualFree(self.base.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_break_moves_within_capacity() {
        let mut brk = FixedBreak::new(256).unwrap();
        let start = brk.current().unwrap();

        unsafe {
            assert_eq!(brk.adjust(128).unwrap(), start);
            assert_eq!(brk.adjust(128).unwrap(), start.add(128));
            assert_eq!(brk.current().unwrap(), start.add(256));
            assert_eq!(brk.used(), 256);

            assert_eq!(brk.adjust(-64).unwrap(), start.add(256));
            assert_eq!(brk.used(), 192);
        }
    }

    #[test]
    fn fixed_break_out_of_memory() {
        let mut brk = FixedBreak::new(64).unwrap();

        unsafe {
            assert_eq!(brk.adjust(65), Err(BreakError::OutOfMemory));
            assert_eq!(brk.used(), 0);
            assert_eq!(brk.adjust(isize::MAX), Err(BreakError::OutOfMemory));
        }
    }

    #[test]
    fn fixed_break_cannot_go_below_origin() {
        let mut brk = FixedBreak::new(64).unwrap();

        unsafe {
            brk.adjust(32).unwrap();
            assert_eq!(brk.adjust(-33), Err(BreakError::Underflow));
            assert_eq!(brk.used(), 32);
        }
    }

    #[test]
    fn fixed_break_memory_is_aligned_and_writable() {
        let mut brk = FixedBreak::new(4096).unwrap();

        unsafe {
            let ptr = brk.adjust(64).unwrap();
            assert_eq!(ptr.as_ptr() as usize % MAX_ALIGNMENT, 0);

            ptr.as_ptr().write_bytes(0xAB, 64);
            assert_eq!(*ptr.as_ptr().add(63), 0xAB);
        }
    }
}
