//! Atomic f32 scatter-add over caller-owned buffers.
//!
//! Backward passes accumulate gradients for key/value rows from many query
//! rows at once. Workers share the target buffer through this view and add
//! into it with a compare-exchange loop on the bit pattern.

use std::sync::atomic::{AtomicU32, Ordering};

/// Shared view of a `&mut [f32]` that accepts concurrent adds.
pub struct AtomicF32Slice<'a> {
    cells: &'a [AtomicU32],
}

impl<'a> AtomicF32Slice<'a> {
    pub fn new(data: &'a mut [f32]) -> Self {
        // SAFETY: f32 and AtomicU32 have the same size and alignment, and the
        // exclusive borrow guarantees no non-atomic access for 'a.
        let cells = unsafe { &*(data as *mut [f32] as *const [AtomicU32]) };
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn add(&self, index: usize, value: f32) {
        let cell = &self.cells[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// `self[offset + i] += weight * x[i]`
    #[inline]
    pub fn axpy(&self, offset: usize, x: &[f32], weight: f32) {
        if weight == 0.0 {
            return;
        }
        for (i, &xi) in x.iter().enumerate() {
            self.add(offset + i, weight * xi);
        }
    }

    pub fn load(&self, index: usize) -> f32 {
        f32::from_bits(self.cells[index].load(Ordering::Relaxed))
    }
}
