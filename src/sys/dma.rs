//! Physically contiguous buffers shared with a DMA-capable controller.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::rc::Rc;

use super::{Kernel, SysResult};

/// Alignment and granule of SDMA transfers.
pub const DMA_ALIGN: usize = 4096;

/// A 4 KiB-aligned buffer with a known physical address.
///
/// The buffer doubles as the host block cache of the SD driver and as the
/// SDMA target. The physical address never leaves the driver; clients only
/// ever see copies made through `writemsg`.
pub struct DmaBuffer {
	ptr: *mut u8,
	len: usize,
	paddr: u64,
	kernel: Rc<dyn Kernel>,
}

impl DmaBuffer {
	pub fn new(kernel: Rc<dyn Kernel>, len: usize) -> SysResult<DmaBuffer> {
		let layout = Layout::from_size_align(len, DMA_ALIGN).expect("dma buffer layout");
		let ptr = unsafe { alloc_zeroed(layout) };
		assert!(!ptr.is_null(), "dma buffer allocation failed");
		let paddr = kernel.virtual_to_phys(ptr)?;
		Ok(DmaBuffer {
			ptr,
			len,
			paddr,
			kernel,
		})
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	#[inline]
	pub fn paddr(&self) -> u64 {
		self.paddr
	}

	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
	}

	/// Cleans the cache before the device reads the buffer (DMA write path).
	pub fn flush(&self) {
		self.kernel.dcache_flush(self.ptr, self.len);
	}

	/// Invalidates the cache before the CPU reads device-written data.
	pub fn invalidate(&self) {
		self.kernel.dcache_invalidate(self.ptr, self.len);
	}
}

impl Drop for DmaBuffer {
	fn drop(&mut self) {
		let layout = Layout::from_size_align(self.len, DMA_ALIGN).expect("dma buffer layout");
		unsafe { dealloc(self.ptr, layout) };
	}
}
