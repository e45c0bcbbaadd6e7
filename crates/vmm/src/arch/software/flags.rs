//! Page-table entry flags for the software scale model.

/// Permission and status flags for a page-table entry.
///
/// The bit assignments follow RISC-V so that code written against the scale
/// model reads the same as the Sv39 version: V, R, W, X and U occupy bits
/// 0 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Valid bit: the entry refers to a frame or a next-level table.
    const VALID: usize = 1 << 0;

    /// Readable bit.
    const READABLE: usize = 1 << 1;

    /// Writable bit.
    const WRITABLE: usize = 1 << 2;

    /// Executable bit.
    const EXECUTABLE: usize = 1 << 3;

    /// User-accessible bit.
    const USER: usize = 1 << 4;

    /// Creates empty flags (entry not valid).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Returns whether the valid bit is set.
    pub fn is_valid(self) -> bool {
        (self.0 & Self::VALID) != 0
    }

    /// Sets or clears the valid bit.
    pub fn set_valid(&mut self, valid: bool) {
        self.update(Self::VALID, valid);
    }

    /// Returns whether the readable bit is set.
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READABLE) != 0
    }

    /// Sets or clears the readable bit.
    pub fn set_readable(&mut self, readable: bool) {
        self.update(Self::READABLE, readable);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.update(Self::WRITABLE, writable);
    }

    /// Returns whether the executable bit is set.
    pub fn is_executable(self) -> bool {
        (self.0 & Self::EXECUTABLE) != 0
    }

    /// Sets or clears the executable bit.
    pub fn set_executable(&mut self, executable: bool) {
        self.update(Self::EXECUTABLE, executable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.update(Self::USER, user);
    }

    /// Returns whether any of R, W or X is set, marking a leaf entry.
    pub fn is_leaf(self) -> bool {
        (self.0 & (Self::READABLE | Self::WRITABLE | Self::EXECUTABLE)) != 0
    }

    fn update(&mut self, mask: usize, set: bool) {
        if set {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
