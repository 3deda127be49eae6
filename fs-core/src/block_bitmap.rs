//! Free-block bitmap kept inside the superblock
//!
//! One bit per block number; bit set means the block is free.
//! Only the first [`MAX_OBJECTS`] block numbers can be represented.

use serde::Serialize;

use crate::layout::{FIRST_ALLOCATABLE_BLOCK, MAX_OBJECTS};

/// 64-bit free-block bitmap, 1 = free, 0 = allocated
#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FreeBitmap(u64);

impl FreeBitmap {
    /// Wrap the raw on-disk value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Bitmap for a freshly formatted device of `block_count` blocks:
    /// `reserved` leading blocks and everything past the device end allocated
    pub fn for_device(block_count: u64, reserved: u64) -> Self {
        let mut bitmap = Self(!0);
        for block in 0..reserved.min(MAX_OBJECTS) {
            bitmap.mark_used(block);
        }
        for block in block_count..MAX_OBJECTS {
            bitmap.mark_used(block);
        }
        bitmap
    }

    /// Raw value as stored on disk
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Check if a block is free; positions past the bitmap are never free
    pub fn is_free(&self, block: u64) -> bool {
        block < MAX_OBJECTS && self.0 & (1 << block) != 0
    }

    /// First free block the allocator may hand out
    pub fn first_free(&self) -> Option<u64> {
        (FIRST_ALLOCATABLE_BLOCK..MAX_OBJECTS).find(|&block| self.is_free(block))
    }

    /// Clear the bit of `block`; returns false if it was already allocated
    pub fn mark_used(&mut self, block: u64) -> bool {
        if block >= MAX_OBJECTS {
            return false;
        }
        let was_free = self.is_free(block);
        self.0 &= !(1 << block);
        was_free
    }

    /// Set the bit of `block`; returns false if it was already free
    pub fn mark_free(&mut self, block: u64) -> bool {
        if block >= MAX_OBJECTS {
            return false;
        }
        let was_used = !self.is_free(block);
        self.0 |= 1 << block;
        was_used
    }

    /// Number of free blocks the allocator can still hand out
    pub fn free_count(&self) -> u64 {
        (FIRST_ALLOCATABLE_BLOCK..MAX_OBJECTS)
            .filter(|&block| self.is_free(block))
            .count() as u64
    }
}

impl std::fmt::Debug for FreeBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FreeBitmap({:#018x}, {} free)", self.0, self.free_count())
    }
}
