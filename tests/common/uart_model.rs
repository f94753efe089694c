//! A small behavioural model of the AUX mini-UART: an unbounded receive
//! FIFO the test feeds, and a transmit log that is always ready.

use std::cell::RefCell;
use std::collections::VecDeque;

use osprey_drivers::drivers::uart::miniuart;
use osprey_drivers::sys::mmio::MmioIo;

#[derive(Default)]
struct UartState {
	rx: VecDeque<u8>,
	tx: Vec<u8>,
	ier: u32,
	lcr: u32,
	mcr: u32,
	cntl: u32,
	baud: u32,
}

#[derive(Default)]
pub struct MiniUartModel {
	state: RefCell<UartState>,
}

impl MiniUartModel {
	pub fn new() -> MiniUartModel {
		MiniUartModel::default()
	}

	/// Queues bytes "on the wire".
	pub fn feed(&self, bytes: &[u8]) {
		self.state.borrow_mut().rx.extend(bytes.iter().copied());
	}

	/// Everything the driver transmitted so far.
	pub fn tx_log(&self) -> Vec<u8> {
		self.state.borrow().tx.clone()
	}

	pub fn clear_tx(&self) {
		self.state.borrow_mut().tx.clear();
	}

	pub fn baud_register(&self) -> u32 {
		self.state.borrow().baud
	}
}

impl MmioIo for MiniUartModel {
	fn read32(&self, offset: usize) -> u32 {
		let mut state = self.state.borrow_mut();
		match offset {
			miniuart::MU_IO => state.rx.pop_front().map_or(0, u32::from),
			miniuart::MU_IER => state.ier,
			miniuart::MU_IIR => {
				// Transmit idle; receive pending while the FIFO holds data.
				let mut value = 1 << 1;
				if !state.rx.is_empty() {
					value |= 1 << 2;
				}
				value
			}
			miniuart::MU_LCR => state.lcr,
			miniuart::MU_MCR => state.mcr,
			miniuart::MU_LSR => {
				// Transmitter always empty; receiver ready when fed.
				let mut value = (1 << 5) | (1 << 6);
				if !state.rx.is_empty() {
					value |= 1 << 0;
				}
				value
			}
			miniuart::MU_CNTL => state.cntl,
			miniuart::MU_BAUD => state.baud,
			_ => 0,
		}
	}

	fn write32(&self, offset: usize, value: u32) {
		let mut state = self.state.borrow_mut();
		match offset {
			miniuart::MU_IO => state.tx.push(value as u8),
			miniuart::MU_IER => state.ier = value,
			miniuart::MU_IIR => {}
			miniuart::MU_LCR => state.lcr = value,
			miniuart::MU_MCR => state.mcr = value,
			miniuart::MU_CNTL => state.cntl = value,
			miniuart::MU_BAUD => state.baud = value,
			_ => {}
		}
	}
}
