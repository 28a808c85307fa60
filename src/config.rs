use crate::{block::TagLayout, error::ConfigError, utils::align};

/// Alignment used when none is given. Every segment size is a multiple of it.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Largest alignment accepted by [`Config::validate`].
pub const MAX_ALIGNMENT: usize = 4096;

/// Initial heap size used when none is given.
pub const DEFAULT_INITIAL_SIZE: usize = 4096;

/// Construction parameters of an [`crate::Allocator`].
///
/// ```
/// use tagheap::Config;
///
/// let config = Config::default().with_alignment(32).with_initial_size(1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Byte multiple every segment size is rounded to. Must be a power of two.
    pub alignment: usize,
    /// Bytes requested from the program break at construction. Rounded up to
    /// `alignment`. Zero starts with an empty heap.
    pub initial_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_ALIGNMENT, DEFAULT_INITIAL_SIZE)
    }
}

impl Config {
    pub const fn new(alignment: usize, initial_size: usize) -> Self {
        Self { alignment, initial_size }
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Checks the parameters and returns the initial heap size rounded up to
    /// the alignment.
    pub fn validate(&self) -> Result<usize, ConfigError> {
        if !self.alignment.is_power_of_two() || self.alignment > MAX_ALIGNMENT {
            return Err(ConfigError::Alignment(self.alignment));
        }

        let size = align(self.initial_size, self.alignment)
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or(ConfigError::InitialSizeTooLarge(self.initial_size))?;

        // A non empty heap starts as one free block, which needs both of its
        // tags and at least one aligned unit of payload.
        let min = TagLayout::new(self.alignment).overhead() + self.alignment;
        if size != 0 && size < min {
            return Err(ConfigError::InitialSizeTooSmall { size: self.initial_size, min });
        }

        Ok(size)
    }
}
