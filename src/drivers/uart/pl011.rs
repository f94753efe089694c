//! ARM PL011 UART adapter.

use std::cell::Cell;
use std::rc::Rc;

use bitflags::bitflags;

use super::{UartHardware, WakeFlags, UART_EVENT_BIT};
use crate::drivers::DriverError;
use crate::sys::mmio::{MmioIo, MmioWindow};
use crate::sys::{DeviceNode, Kernel};
use crate::tty::termios::{ControlFlags, Termios};

pub const DR: usize = 0x00;
pub const FR: usize = 0x18;
pub const IBRD: usize = 0x24;
pub const FBRD: usize = 0x28;
pub const LCRH: usize = 0x2c;
pub const CR: usize = 0x30;
pub const IFLS: usize = 0x34;
pub const IMSC: usize = 0x38;
pub const MIS: usize = 0x40;
pub const ICR: usize = 0x44;

/// UARTCLK as set up by the firmware.
const UART_CLOCK: u32 = 48_000_000;

bitflags! {
	struct Flags: u32 {
		const BUSY = 1 << 3;
		const RX_EMPTY = 1 << 4;
		const TX_FULL = 1 << 5;
	}
}

const LCRH_PEN: u32 = 1 << 1;
const LCRH_STP2: u32 = 1 << 3;
const LCRH_FEN: u32 = 1 << 4;
const LCRH_WLEN8: u32 = 0x3 << 5;

const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;
const CR_RTSEN: u32 = 1 << 14;
const CR_CTSEN: u32 = 1 << 15;

/// FIFO interrupt levels at half full.
const IFLS_HALF: u32 = (2 << 3) | 2;

bitflags! {
	struct Interrupts: u32 {
		const RX = 1 << 4;
		const TX = 1 << 5;
		const RX_TIMEOUT = 1 << 6;
		const ALL = 0x7ff;
	}
}

pub struct Pl011Uart {
	kernel: Rc<dyn Kernel>,
	regs: Rc<dyn MmioIo>,
	irq: u32,
	interrupt_masked: Cell<bool>,
}

impl Pl011Uart {
	pub fn new(kernel: Rc<dyn Kernel>, regs: Rc<dyn MmioIo>, irq: u32) -> Pl011Uart {
		Pl011Uart {
			kernel,
			regs,
			irq,
			interrupt_masked: Cell::new(true),
		}
	}

	pub fn probe(
		kernel: &Rc<dyn Kernel>,
		node: &DeviceNode,
	) -> Result<Rc<Pl011Uart>, DriverError> {
		let regs = MmioWindow::map(&**kernel, node.reg_base, node.reg_size)?;
		kernel.add_interrupt_server(node.irq, UART_EVENT_BIT)?;
		Ok(Rc::new(Pl011Uart::new(kernel.clone(), regs, node.irq)))
	}
}

impl UartHardware for Pl011Uart {
	fn configure(&self, termios: &Termios) -> Result<(), DriverError> {
		let baud = termios.c_ispeed;
		let cflags = termios.cflags();

		self.regs.write32(CR, 0);
		self.kernel.delay_micros(100);

		// Flush the transmit FIFO while reprogramming.
		let lcrh = self.regs.read32(LCRH);
		self.regs.write32(LCRH, lcrh & !LCRH_FEN);

		let divider = UART_CLOCK / (16 * baud);
		let remainder = ((UART_CLOCK % (16 * baud)) * 8) / baud;
		let fraction = (remainder >> 1) + (remainder & 1);
		self.regs.write32(IBRD, divider);
		self.regs.write32(FBRD, fraction);

		let mut lcrh = LCRH_FEN | LCRH_WLEN8;
		if cflags.contains(ControlFlags::CSTOPB) {
			lcrh |= LCRH_STP2;
		}
		if cflags.contains(ControlFlags::PARENB) {
			lcrh |= LCRH_PEN;
		}
		self.regs.write32(LCRH, lcrh);

		self.regs.write32(IFLS, IFLS_HALF);
		self.regs.write32(ICR, Interrupts::ALL.bits());
		self.regs
			.write32(IMSC, (Interrupts::RX | Interrupts::RX_TIMEOUT | Interrupts::TX).bits());

		let mut cr = CR_UARTEN | CR_TXE | CR_RXE;
		if cflags.contains(ControlFlags::CRTSCTS) {
			cr |= CR_RTSEN | CR_CTSEN;
		}
		self.regs.write32(CR, cr);
		Ok(())
	}

	fn read_ready(&self) -> bool {
		!Flags::from_bits_truncate(self.regs.read32(FR)).contains(Flags::RX_EMPTY)
	}

	fn write_ready(&self) -> bool {
		!Flags::from_bits_truncate(self.regs.read32(FR)).contains(Flags::TX_FULL)
	}

	fn read_byte(&self) -> u8 {
		while !self.read_ready() {}
		self.regs.read32(DR) as u8
	}

	fn write_byte(&self, byte: u8) {
		while !self.write_ready() {}
		self.regs.write32(DR, byte as u32);
	}

	fn handle_interrupt(&self, bits: u32) -> WakeFlags {
		if bits & (1 << UART_EVENT_BIT) == 0 {
			return WakeFlags::empty();
		}
		self.interrupt_masked.set(true);

		let status = Interrupts::from_bits_truncate(self.regs.read32(MIS));
		let mut wake = WakeFlags::empty();
		if status.intersects(Interrupts::RX | Interrupts::RX_TIMEOUT) {
			wake |= WakeFlags::RX;
		}
		if status.contains(Interrupts::TX) {
			wake |= WakeFlags::TX;
		}
		self.regs.write32(ICR, Interrupts::ALL.bits());
		wake
	}

	fn unmask_interrupt(&self) {
		if self.interrupt_masked.get() {
			if let Err(err) = self.kernel.unmask_interrupt(self.irq) {
				warn!("pl011: unmask failed: {err}");
			}
			self.interrupt_masked.set(false);
		}
	}
}
