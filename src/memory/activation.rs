//! Activation scratch shared by every execution context.
//!
//! Contexts of different models all point at the same base address. That
//! is only sound because capture and replay happen on one stream, so two
//! models never run at the same time.

use crate::backend::{Backend, DeviceBuffer, DeviceError, DevicePtr};
use crate::memory::bytes_to_string;

/// One fixed-size device allocation.
pub struct ActivationSpace<B: Backend> {
    backing: B::Buffer,
}

impl<B: Backend> ActivationSpace<B> {
    pub fn new(backend: &B, bytes: usize) -> Result<Self, DeviceError> {
        let backing = backend.allocate(bytes)?;
        tracing::debug!(
            base = %backing.device_ptr(),
            size = %bytes_to_string(bytes),
            "allocated activation space"
        );
        Ok(Self { backing })
    }

    pub fn data(&self) -> DevicePtr {
        self.backing.device_ptr()
    }

    pub fn size(&self) -> usize {
        self.backing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;

    #[test]
    fn exposes_base_and_size() {
        let backend = HostBackend::default();
        let space = ActivationSpace::new(&backend, 128 * 1024).unwrap();
        assert_eq!(space.size(), 128 * 1024);
        assert!(space.data().is_aligned_to(backend.alignment()));
        assert_eq!(backend.probe().allocation_count(), 1);
    }
}
