//! Device memory stack — a bump allocator over one device allocation.
//!
//! Bindings baked into a captured graph are pushed here during the build
//! phase. The stack never grows after construction and never frees
//! individual ranges; `reset()` rewinds it to offset zero so the next model
//! can reuse the same memory.

use crate::backend::{Backend, DeviceBuffer, DeviceError, DevicePtr};
use crate::memory::{align_up, bytes_to_string};
use thiserror::Error;

/// Errors from the memory stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("binding stack exhausted ({requested} bytes requested, {available} available, {capacity} total)")]
    Exhausted {
        requested: usize,
        available: usize,
        capacity: usize,
    },
}

/// A bump allocator over a single pre-sized device buffer.
pub struct MemoryStack<B: Backend> {
    /// The single device allocation backing every range.
    backing: B::Buffer,

    /// Base device address of the backing allocation.
    base_ptr: DevicePtr,

    /// Alignment of every range handed out.
    alignment: usize,

    /// Offset of the next free byte.
    offset: usize,
}

impl<B: Backend> MemoryStack<B> {
    /// Allocate `capacity` bytes on `backend` to serve as the stack.
    pub fn new(backend: &B, capacity: usize) -> Result<Self, DeviceError> {
        let backing = backend.allocate(capacity)?;
        let base_ptr = backing.device_ptr();
        tracing::debug!(
            base = %base_ptr,
            capacity = %bytes_to_string(capacity),
            "allocated binding stack"
        );
        Ok(Self {
            backing,
            base_ptr,
            alignment: backend.alignment(),
            offset: 0,
        })
    }

    /// Push `size` bytes and return the aligned start of the range.
    pub fn allocate(&mut self, size: usize) -> Result<DevicePtr, StackError> {
        // Align the address, not the offset; the backing base may be unaligned.
        let base = self.base_ptr.addr() as usize;
        let start = align_up(base + self.offset, self.alignment) - base;
        let end = start + size;
        if end > self.capacity() {
            return Err(StackError::Exhausted {
                requested: size,
                available: self.available(),
                capacity: self.capacity(),
            });
        }
        self.offset = end;
        Ok(self.base_ptr.offset(start))
    }

    /// Rewind to offset zero. The backing allocation is kept.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn capacity(&self) -> usize {
        self.backing.len()
    }

    /// Bytes handed out since the last reset, including alignment padding.
    pub fn used(&self) -> usize {
        self.offset
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.offset
    }

    pub fn base_ptr(&self) -> DevicePtr {
        self.base_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{FaultPoint, HostBackend, HostBackendConfig};

    fn make_stack(capacity: usize) -> (HostBackend, MemoryStack<HostBackend>) {
        let backend = HostBackend::default();
        let stack = MemoryStack::new(&backend, capacity).expect("Failed to create stack");
        (backend, stack)
    }

    #[test]
    fn ranges_are_aligned_and_disjoint() {
        let (_backend, mut stack) = make_stack(4096);
        let a = stack.allocate(10).unwrap();
        let b = stack.allocate(300).unwrap();
        let c = stack.allocate(1).unwrap();

        assert_eq!(a, stack.base_ptr());
        assert_eq!(b.addr() - a.addr(), 256);
        assert_eq!(c.addr() - b.addr(), 512);
        for p in [a, b, c] {
            assert!(p.is_aligned_to(256));
        }
        assert_eq!(stack.used(), 769);
    }

    #[test]
    fn reset_rewinds_to_base() {
        let (_backend, mut stack) = make_stack(4096);
        let first = stack.allocate(1000).unwrap();
        stack.allocate(1000).unwrap();
        stack.reset();
        assert_eq!(stack.used(), 0);
        assert_eq!(stack.allocate(1).unwrap(), first);
    }

    #[test]
    fn exhaust_stack() {
        let (_backend, mut stack) = make_stack(1024);
        stack.allocate(768).unwrap();

        let err = stack.allocate(257).unwrap_err();
        assert!(matches!(
            err,
            StackError::Exhausted {
                requested: 257,
                available: 256,
                capacity: 1024
            }
        ));
        // Offset untouched by the failed push
        assert_eq!(stack.used(), 768);
    }

    #[test]
    fn exact_fit_succeeds() {
        let (_backend, mut stack) = make_stack(512);
        stack.allocate(256).unwrap();
        stack.allocate(256).unwrap();
        assert_eq!(stack.available(), 0);
    }

    #[test]
    fn unaligned_backing_is_realigned() {
        let backend = HostBackend::new(HostBackendConfig {
            alignment: 256,
            base_address: 0x1080,
            ..Default::default()
        })
        .unwrap();
        let mut stack = MemoryStack::new(&backend, 4096).unwrap();
        let p = stack.allocate(16).unwrap();
        assert_eq!(p, DevicePtr(0x1100));
        assert_eq!(stack.used(), 0x80 + 16);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let backend = HostBackend::default();
        backend.inject_fault(FaultPoint::Allocate);
        let err = MemoryStack::new(&backend, 4096).err().unwrap();
        assert!(matches!(err, DeviceError::Injected(FaultPoint::Allocate)));
    }

    #[test]
    fn dropping_the_stack_frees_backing() {
        let (backend, stack) = make_stack(4096);
        assert_eq!(backend.probe().live_buffers(), 1);
        drop(stack);
        assert_eq!(backend.probe().live_buffers(), 0);
    }
}
