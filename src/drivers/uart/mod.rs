//! UART board adapters.
//!
//! The TTY pipeline talks to the serial hardware through [`UartHardware`]:
//! configure, the two ready predicates, bytewise FIFO access, the interrupt
//! bottom half and re-arming. The Raspberry Pi 4 console lives on the AUX
//! mini-UART; the PL011 adapter covers boards that route the console to the
//! PrimeCell UART instead.

pub mod miniuart;
pub mod pl011;

use std::rc::Rc;

use bitflags::bitflags;

use super::DriverError;
use crate::sys::{DeviceNode, Kernel};
use crate::tty::termios::Termios;

/// Thread-event bit used for the UART interrupt server.
pub const UART_EVENT_BIT: u32 = 0;

bitflags! {
	/// Which side of the pipeline an interrupt made ready.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct WakeFlags: u32 {
		const RX = 1 << 0;
		const TX = 1 << 1;
	}
}

pub trait UartHardware {
	/// Programs line parameters from the termios image.
	fn configure(&self, termios: &Termios) -> Result<(), DriverError>;

	/// A received byte is waiting in the FIFO.
	fn read_ready(&self) -> bool;

	/// The transmit FIFO can take another byte.
	fn write_ready(&self) -> bool;

	fn read_byte(&self) -> u8;

	fn write_byte(&self, byte: u8);

	/// Bottom half: decodes the device's interrupt cause from the
	/// thread-event mask and reports which rendezvous to wake. Leaves the
	/// line masked.
	fn handle_interrupt(&self, bits: u32) -> WakeFlags;

	/// Re-arms the interrupt line, once the scheduler has drained.
	fn unmask_interrupt(&self);
}

/// Selects the board adapter for a device-tree node.
pub fn probe(
	kernel: &Rc<dyn Kernel>,
	node: &DeviceNode,
) -> Result<Rc<dyn UartHardware>, DriverError> {
	if node.compatible.contains("brcm,bcm2835-aux") {
		Ok(miniuart::MiniUart::probe(kernel, node)?)
	} else if node.compatible.contains("arm,pl011") {
		Ok(pl011::Pl011Uart::probe(kernel, node)?)
	} else {
		Err(DriverError::UnsupportedHardware(node.compatible.clone()))
	}
}
