//! Per-process descriptor table.
//!
//! A fixed array of [`MAX_OPEN_FILES`] slots mapping small non-negative
//! integers to file objects. Allocation always takes the lowest free slot;
//! a pair reservation is atomic, so descriptor exhaustion never leaves a
//! half-allocated pair behind.

use crate::error::{KernelError, Result};
use crate::vfs::FileObject;

/// Maximum number of open descriptors per process.
pub const MAX_OPEN_FILES: usize = 16;

/// File descriptor type. Valid descriptors are `0..MAX_OPEN_FILES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fid(pub i32);

impl core::fmt::Display for Fid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process's open-file table.
pub struct FidTable {
    slots: [Option<FileObject>; MAX_OPEN_FILES],
}

impl FidTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }

    fn slot_index(fid: Fid) -> Result<usize> {
        let index = usize::try_from(fid.0).map_err(|_| KernelError::InvalidHandle)?;
        if index >= MAX_OPEN_FILES {
            return Err(KernelError::InvalidHandle);
        }
        Ok(index)
    }

    /// Resolve a descriptor to its file object.
    pub fn get(&self, fid: Fid) -> Result<FileObject> {
        self.slots[Self::slot_index(fid)?].ok_or(KernelError::InvalidHandle)
    }

    fn lowest_free(&self, skip: Option<usize>) -> Result<usize> {
        self.slots
            .iter()
            .enumerate()
            .position(|(index, slot)| slot.is_none() && Some(index) != skip)
            .ok_or(KernelError::TooManyOpenFiles)
    }

    /// Reserve the lowest free slot for `object`.
    pub fn reserve(&mut self, object: FileObject) -> Result<Fid> {
        let index = self.lowest_free(None)?;
        self.slots[index] = Some(object);
        Ok(Fid(index as i32))
    }

    /// Reserve the two lowest free slots for `first` and `second`.
    ///
    /// Fails without touching the table when fewer than two slots are free.
    pub fn reserve_pair(
        &mut self,
        first: FileObject,
        second: FileObject,
    ) -> Result<(Fid, Fid)> {
        let a = self.lowest_free(None)?;
        let b = self.lowest_free(Some(a))?;
        self.slots[a] = Some(first);
        self.slots[b] = Some(second);
        Ok((Fid(a as i32), Fid(b as i32)))
    }

    /// Release a descriptor, returning the object it referenced.
    pub fn remove(&mut self, fid: Fid) -> Result<FileObject> {
        let index = Self::slot_index(fid)?;
        self.slots[index]
            .take()
            .ok_or(KernelError::InvalidHandle)
    }

    /// Empty the table, returning every open entry.
    pub fn drain(&mut self) -> Vec<(Fid, FileObject)> {
        let mut open = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(object) = slot.take() {
                open.push((Fid(index as i32), object));
            }
        }
        open
    }
}

impl Default for FidTable {
    fn default() -> Self {
        Self::new()
    }
}
