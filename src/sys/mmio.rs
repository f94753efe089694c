//! Access to memory-mapped register windows.
//!
//! Device adapters program their hardware through the [`MmioIo`] capability
//! instead of raw pointers, so the register-level controller models of the
//! test suite can stand in for the real windows.

use std::rc::Rc;

use super::{Kernel, SysResult};

/// A 32-bit register window.
pub trait MmioIo {
	fn read32(&self, offset: usize) -> u32;
	fn write32(&self, offset: usize, value: u32);
}

/// A mapped physical register window.
pub struct MmioWindow {
	base: *mut u32,
	len: usize,
}

impl MmioWindow {
	/// Maps `len` bytes of registers at physical `paddr`, uncached.
	pub fn map(kernel: &dyn Kernel, paddr: u64, len: usize) -> SysResult<Rc<MmioWindow>> {
		let base = kernel.map_phys_mem(paddr, len)?;
		Ok(Rc::new(MmioWindow { base, len }))
	}
}

impl MmioIo for MmioWindow {
	#[inline]
	fn read32(&self, offset: usize) -> u32 {
		assert!(offset + 4 <= self.len);
		debug_assert_eq!(offset % 4, 0);
		unsafe { self.base.add(offset / 4).read_volatile() }
	}

	#[inline]
	fn write32(&self, offset: usize, value: u32) {
		assert!(offset + 4 <= self.len);
		debug_assert_eq!(offset % 4, 0);
		unsafe { self.base.add(offset / 4).write_volatile(value) }
	}
}
