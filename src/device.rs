//! Device-resident storage for the CPU backends.
//!
//! Strategy tasks write through shared references concurrently, including the
//! channel buffer's aliased writes, so cells are atomics. Relaxed ordering is
//! enough: the dispatch join (or a work-group barrier) orders every write
//! before the host reads it back.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::error::EngineError;

pub struct DeviceBuffer {
    cells: Box<[AtomicU32]>,
}

impl DeviceBuffer {
    pub fn new(len: usize) -> Self {
        DeviceBuffer {
            cells: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.cells[index].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.cells[index].load(Ordering::Relaxed)
    }

    /// Copies every cell into an existing host buffer of the same length.
    pub fn synchronize(&self, host: &mut [u32]) {
        debug_assert_eq!(host.len(), self.cells.len());
        host.par_iter_mut()
            .zip(self.cells.par_iter())
            .for_each(|(dst, src)| *dst = src.load(Ordering::Relaxed));
    }

    /// Copies into a freshly allocated host buffer. On allocation failure the
    /// previous host contents are left untouched.
    pub fn copy_back(&self, host: &mut Vec<u32>) -> Result<(), EngineError> {
        copy_back(self.cells.iter().map(|c| c.load(Ordering::Relaxed)), host)
    }
}

/// Stages `cells` into a new allocation and swaps it into `host`.
pub fn copy_back<I>(cells: I, host: &mut Vec<u32>) -> Result<(), EngineError>
where
    I: ExactSizeIterator<Item = u32>,
{
    let len = cells.len();
    let mut staged = Vec::new();
    staged
        .try_reserve_exact(len)
        .map_err(|_| EngineError::Allocation { len })?;
    staged.extend(cells);
    *host = staged;
    Ok(())
}

/// Reuses `slot` when it already has `len` cells.
pub(crate) fn sized(slot: &mut Option<DeviceBuffer>, len: usize) -> &DeviceBuffer {
    if slot.as_ref().is_some_and(|b| b.len() != len) {
        *slot = None;
    }
    slot.get_or_insert_with(|| DeviceBuffer::new(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronize_copies_all_cells() {
        let device = DeviceBuffer::new(5);
        for i in 0..5 {
            device.store(i, i as u32 * 10);
        }
        let mut host = vec![7; 5];
        device.synchronize(&mut host);
        assert_eq!(host, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn copy_back_replaces_host_buffer() {
        let device = DeviceBuffer::new(3);
        device.store(1, 9);
        let mut host = vec![1, 2];
        device.copy_back(&mut host).unwrap();
        assert_eq!(host, vec![0, 9, 0]);
    }

    struct Huge;

    impl Iterator for Huge {
        type Item = u32;
        fn next(&mut self) -> Option<u32> {
            None
        }
        fn size_hint(&self) -> (usize, Option<usize>) {
            (usize::MAX, Some(usize::MAX))
        }
    }

    impl ExactSizeIterator for Huge {}

    #[test]
    fn failed_copy_back_keeps_previous_contents() {
        let mut host = vec![4, 5, 6];
        let err = copy_back(Huge, &mut host).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Allocation { len } if len == usize::MAX
        ));
        assert_eq!(host, vec![4, 5, 6]);
    }

    #[test]
    fn sized_reallocates_only_on_length_change() {
        let mut slot = None;
        sized(&mut slot, 4).store(0, 1);
        assert_eq!(sized(&mut slot, 4).load(0), 1);
        assert_eq!(sized(&mut slot, 8).load(0), 0);
        assert_eq!(slot.as_ref().map(DeviceBuffer::len), Some(8));
    }
}
