//! BCM2835 AUX mini-UART adapter.
//!
//! The RPi4 console UART. GPIO pins 14/15 must already be switched to ALT5
//! by the bootloader or the gpio driver; only the AUX block itself is
//! programmed here. The mini-UART has no parity, no second stop bit and no
//! hardware flow control; requests for those are logged and ignored.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;

use super::{UartHardware, WakeFlags, UART_EVENT_BIT};
use crate::drivers::DriverError;
use crate::sys::mmio::{MmioIo, MmioWindow};
use crate::sys::{DeviceNode, Kernel};
use crate::tty::termios::{ControlFlags, Termios};

/// Register offsets within the AUX block.
pub const MU_IO: usize = 0x40;
pub const MU_IER: usize = 0x44;
pub const MU_IIR: usize = 0x48;
pub const MU_LCR: usize = 0x4c;
pub const MU_MCR: usize = 0x50;
pub const MU_LSR: usize = 0x54;
pub const MU_CNTL: usize = 0x60;
pub const MU_BAUD: usize = 0x68;

/// The AUX block hangs off the 500 MHz core clock.
const AUX_UART_CLOCK: u32 = 500_000_000;

const LCR_8BIT: u32 = 0x03;
const CNTL_RX_ENABLE: u32 = 1 << 0;
const CNTL_TX_ENABLE: u32 = 1 << 1;
const IER_RX_ENABLE: u32 = 1 << 0;
const IER_TX_ENABLE: u32 = 1 << 1;
/// Writing the FIFO-clear bits; the top bits read back as FIFO-enables.
const IIR_FIFO_CLEAR: u32 = 0x06 | 0xc0;

bitflags! {
	struct LineStatus: u32 {
		const RX_READY = 1 << 0;
		const TX_EMPTY = 1 << 5;
	}
}

bitflags! {
	struct IrqStatus: u32 {
		const TX_EMPTY = 1 << 1;
		const RX_READY = 1 << 2;
	}
}

pub struct MiniUart {
	kernel: Rc<dyn Kernel>,
	regs: Rc<dyn MmioIo>,
	irq: u32,
	interrupt_masked: Cell<bool>,
}

impl MiniUart {
	pub fn new(kernel: Rc<dyn Kernel>, regs: Rc<dyn MmioIo>, irq: u32) -> MiniUart {
		MiniUart {
			kernel,
			regs,
			irq,
			interrupt_masked: Cell::new(true),
		}
	}

	/// Maps the AUX registers and registers the interrupt server.
	pub fn probe(
		kernel: &Rc<dyn Kernel>,
		node: &DeviceNode,
	) -> Result<Rc<MiniUart>, DriverError> {
		let regs = MmioWindow::map(&**kernel, node.reg_base, node.reg_size)?;
		kernel.add_interrupt_server(node.irq, UART_EVENT_BIT)?;
		Ok(Rc::new(MiniUart::new(kernel.clone(), regs, node.irq)))
	}

	fn baud_divisor(baud: u32) -> u32 {
		AUX_UART_CLOCK / (baud * 8) - 1
	}
}

impl UartHardware for MiniUart {
	fn configure(&self, termios: &Termios) -> Result<(), DriverError> {
		let cflags = termios.cflags();
		if cflags.contains(ControlFlags::CSTOPB) {
			warn!("miniuart: two stop bits not supported, using one");
		}
		if cflags.contains(ControlFlags::PARENB) {
			warn!("miniuart: parity not supported, disabled");
		}
		if cflags.contains(ControlFlags::CRTSCTS) {
			warn!("miniuart: hardware flow control not supported, disabled");
		}

		self.regs.write32(MU_CNTL, 0);
		self.regs.write32(MU_LCR, LCR_8BIT);
		self.regs.write32(MU_MCR, 0);
		self.regs.write32(MU_IER, 0);
		self.regs.write32(MU_IIR, IIR_FIFO_CLEAR);
		self.regs
			.write32(MU_BAUD, Self::baud_divisor(termios.c_ispeed));

		self.regs.write32(MU_CNTL, CNTL_RX_ENABLE | CNTL_TX_ENABLE);

		// Interrupt generation is enabled here; the line stays masked until
		// the event loop re-arms it.
		self.regs.write32(MU_IER, IER_RX_ENABLE | IER_TX_ENABLE);
		Ok(())
	}

	fn read_ready(&self) -> bool {
		LineStatus::from_bits_truncate(self.regs.read32(MU_LSR)).contains(LineStatus::RX_READY)
	}

	fn write_ready(&self) -> bool {
		LineStatus::from_bits_truncate(self.regs.read32(MU_LSR)).contains(LineStatus::TX_EMPTY)
	}

	fn read_byte(&self) -> u8 {
		while !self.read_ready() {}
		self.regs.read32(MU_IO) as u8
	}

	fn write_byte(&self, byte: u8) {
		while !self.write_ready() {}
		self.regs.write32(MU_IO, byte as u32);
	}

	fn handle_interrupt(&self, bits: u32) -> WakeFlags {
		if bits & (1 << UART_EVENT_BIT) == 0 {
			return WakeFlags::empty();
		}
		self.interrupt_masked.set(true);

		let status = IrqStatus::from_bits_truncate(self.regs.read32(MU_IIR));
		let mut wake = WakeFlags::empty();
		if status.contains(IrqStatus::RX_READY) {
			wake |= WakeFlags::RX;
		}
		if status.contains(IrqStatus::TX_EMPTY) {
			wake |= WakeFlags::TX;
		}
		trace!("miniuart: interrupt, waking {wake:?}");
		wake
	}

	fn unmask_interrupt(&self) {
		if self.interrupt_masked.get() {
			if let Err(err) = self.kernel.unmask_interrupt(self.irq) {
				warn!("miniuart: unmask failed: {err}");
			}
			self.interrupt_masked.set(false);
		}
	}
}
