//! A behavioural model of the BCM2711 EMMC host controller with one SD card
//! inserted, precise enough to drive the whole host state machine: reset and
//! clock bits, the identification command set, PIO data transfer through the
//! DATA register, and a handful of fault-injection knobs.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use osprey_drivers::drivers::sd::regs;
use osprey_drivers::sys::mmio::MmioIo;

const SECTOR: usize = 512;

/// SCR of an SD 3.0 card with 1-bit and 4-bit bus support, as the two
/// little-endian words the driver reads from the DATA FIFO.
const SCR_WORDS: [u32; 2] = [0x0080_0502, 0];

const CARD_CID: [u32; 4] = [0x0001_2345, 0x4f53_5052, 0x4559_4d4d, 0x0003_5344];

const CARD_RCA: u32 = 0x1234;

/// Card states (PLSS 4.1).
const STATE_IDLE: u32 = 0;
const STATE_IDENT: u32 = 2;
const STATE_STBY: u32 = 3;
const STATE_TRAN: u32 = 4;

#[derive(Default)]
struct Registers {
	control0: u32,
	control1: u32,
	control2: u32,
	/// Latched interrupt bits; the error summary and the FIFO-ready bits
	/// are computed on read.
	interrupt: u32,
	irpt_mask: u32,
	irpt_en: u32,
	blksizecnt: u32,
	arg1: u32,
	arg2: u32,
	resp: [u32; 4],
}

pub struct ModelState {
	// Configuration and fault injection.
	pub card_present: bool,
	pub sdhc: bool,
	pub capacity_blocks: u64,
	/// Answer CMD8 with a command-timeout error, like a version 1 card.
	pub v1_card: bool,
	/// ACMD41 polls reporting busy before ready.
	pub acmd41_busy: u32,
	/// Never complete any command (a dead controller).
	pub dead: bool,
	/// Fail this many data commands with a data CRC error.
	pub fail_data_commands: u32,
	/// Accept DMA transfers but never complete them.
	pub fail_dma: bool,

	regs: Registers,
	disk: HashMap<u64, [u8; SECTOR]>,

	card_state: u32,
	app_cmd: bool,

	read_fifo: VecDeque<u32>,
	write_words_left: usize,
	write_fifo: Vec<u32>,
	write_block: u64,
	dma_stuck: bool,

	/// Every CMDTM write, for assertions on the command stream.
	pub command_log: Vec<u32>,
}

pub struct EmmcModel {
	state: RefCell<ModelState>,
}

impl EmmcModel {
	pub fn new(capacity_blocks: u64) -> Rc<EmmcModel> {
		assert_eq!(capacity_blocks % 1024, 0, "CSD v2 capacity granularity");
		Rc::new(EmmcModel {
			state: RefCell::new(ModelState {
				card_present: true,
				sdhc: true,
				capacity_blocks,
				v1_card: false,
				acmd41_busy: 0,
				dead: false,
				fail_data_commands: 0,
				fail_dma: false,
				regs: Registers::default(),
				disk: HashMap::new(),
				card_state: STATE_IDLE,
				app_cmd: false,
				read_fifo: VecDeque::new(),
				write_words_left: 0,
				write_fifo: Vec::new(),
				write_block: 0,
				dma_stuck: false,
				command_log: Vec::new(),
			}),
		})
	}

	pub fn with_state<R>(&self, f: impl FnOnce(&mut ModelState) -> R) -> R {
		f(&mut self.state.borrow_mut())
	}

	pub fn write_block(&self, lba: u64, data: &[u8; SECTOR]) {
		self.state.borrow_mut().disk.insert(lba, *data);
	}

	pub fn block(&self, lba: u64) -> [u8; SECTOR] {
		self.state
			.borrow()
			.disk
			.get(&lba)
			.copied()
			.unwrap_or([0; SECTOR])
	}

	/// Latches a card-removal interrupt, as pulling the card would.
	pub fn inject_card_removal(&self) {
		let mut state = self.state.borrow_mut();
		state.regs.interrupt |= 1 << 7;
	}
}

impl ModelState {
	fn reset_controller(&mut self) {
		self.regs = Registers::default();
		self.read_fifo.clear();
		self.write_words_left = 0;
		self.write_fifo.clear();
		self.dma_stuck = false;
		self.card_state = STATE_IDLE;
		self.app_cmd = false;
	}

	fn dat_busy(&self) -> bool {
		!self.read_fifo.is_empty() || self.write_words_left > 0 || self.dma_stuck
	}

	fn interrupt_value(&self) -> u32 {
		let mut value = self.regs.interrupt;
		if !self.read_fifo.is_empty() {
			value |= 1 << 5; // buffer read ready
		}
		if self.write_words_left > 0 {
			value |= 1 << 4; // buffer write ready
		}
		if value & 0xffff_0000 != 0 {
			value |= 1 << 15; // error summary
		}
		value
	}

	fn status_value(&self) -> u32 {
		let mut value = 0;
		if self.card_present {
			value |= 1 << 16;
		}
		if self.dat_busy() {
			value |= 1 << 1;
		}
		value
	}

	fn complete(&mut self) {
		self.regs.interrupt |= 1 << 0; // command complete
	}

	fn fail_command(&mut self, error_bit: u32) {
		self.regs.interrupt |= error_bit;
	}

	fn start_block(&self, arg: u32) -> u64 {
		if self.sdhc {
			u64::from(arg)
		} else {
			u64::from(arg) / SECTOR as u64
		}
	}

	fn transfer_geometry(&self) -> (usize, usize) {
		let block_size = (self.regs.blksizecnt & 0xfff) as usize;
		let blocks = (self.regs.blksizecnt >> 16) as usize;
		(block_size, blocks)
	}

	fn queue_read(&mut self, arg: u32) {
		let (block_size, blocks) = self.transfer_geometry();
		if block_size == 8 {
			// SEND_SCR reads the configuration register, not the medium.
			for word in SCR_WORDS {
				self.read_fifo.push_back(word);
			}
			return;
		}
		let start = self.start_block(arg);
		for block in 0..blocks as u64 {
			let data = self
				.disk
				.get(&(start + block))
				.copied()
				.unwrap_or([0; SECTOR]);
			for word in data.chunks_exact(4) {
				self.read_fifo
					.push_back(u32::from_le_bytes(word.try_into().unwrap()));
			}
		}
	}

	fn commit_write(&mut self) {
		let bytes: Vec<u8> = self
			.write_fifo
			.drain(..)
			.flat_map(u32::to_le_bytes)
			.collect();
		for (index, sector) in bytes.chunks_exact(SECTOR).enumerate() {
			self.disk
				.insert(self.write_block + index as u64, sector.try_into().unwrap());
		}
		self.regs.interrupt |= 1 << 1; // transfer complete
	}

	fn execute(&mut self, cmd_reg: u32) {
		self.command_log.push(cmd_reg);
		if self.dead {
			return;
		}

		let index = (cmd_reg >> 24) & 0x3f;
		let arg = self.regs.arg1;
		let app = std::mem::replace(&mut self.app_cmd, false);
		let is_dma = cmd_reg & regs::TM_DMA_EN != 0;

		match (app, index) {
			(false, 0) => {
				self.card_state = STATE_IDLE;
				self.complete();
			}
			(false, 5) => {
				// Not an SDIO card: command timeout.
				self.fail_command(1 << 16);
			}
			(false, 8) => {
				if self.v1_card {
					self.fail_command(1 << 16);
				} else {
					self.regs.resp[0] = arg & 0xfff;
					self.complete();
				}
			}
			(false, 55) => {
				self.app_cmd = true;
				self.regs.resp[0] = 1 << 5;
				self.complete();
			}
			(true, 41) => {
				self.regs.resp[0] = if arg == 0 {
					// Inquiry: OCR only, no busy handshake.
					0x00ff_8000
				} else if self.acmd41_busy > 0 {
					self.acmd41_busy -= 1;
					0x00ff_8000
				} else {
					let mut ocr = (1 << 31) | 0x00ff_8000;
					if self.sdhc && arg & (1 << 30) != 0 {
						ocr |= 1 << 30;
					}
					ocr
				};
				self.complete();
			}
			(false, 2) => {
				self.regs.resp = CARD_CID;
				self.card_state = STATE_IDENT;
				self.complete();
			}
			(false, 3) => {
				self.regs.resp[0] = (CARD_RCA << 16) | (1 << 8);
				self.card_state = STATE_STBY;
				self.complete();
			}
			(false, 9) => {
				// CSD version 2.0 sized from the configured capacity.
				let c_size = (self.capacity_blocks / 1024 - 1) as u32;
				self.regs.resp = [0, c_size << 8, 0, 1 << 22];
				self.complete();
			}
			(false, 7) => {
				self.regs.resp[0] = (self.card_state << 9) | (1 << 8);
				self.card_state = STATE_TRAN;
				self.complete();
			}
			(false, 13) => {
				self.regs.resp[0] = (self.card_state << 9) | (1 << 8);
				self.complete();
			}
			(false, 16) => {
				self.complete();
			}
			(false, 12) => {
				self.read_fifo.clear();
				self.write_words_left = 0;
				self.write_fifo.clear();
				self.dma_stuck = false;
				self.card_state = STATE_TRAN;
				self.complete();
			}
			(true, 51) => {
				self.queue_read(arg);
				self.complete();
			}
			(false, 17 | 18) => {
				if self.fail_data_commands > 0 {
					self.fail_data_commands -= 1;
					self.fail_command(1 << 21);
				} else if is_dma && self.fail_dma {
					self.dma_stuck = true;
					self.complete();
				} else {
					self.regs.resp[0] = (self.card_state << 9) | (1 << 8);
					self.queue_read(arg);
					self.complete();
				}
			}
			(false, 24 | 25) => {
				if self.fail_data_commands > 0 {
					self.fail_data_commands -= 1;
					self.fail_command(1 << 21);
				} else if is_dma && self.fail_dma {
					self.dma_stuck = true;
					self.complete();
				} else {
					let (block_size, blocks) = self.transfer_geometry();
					self.regs.resp[0] = (self.card_state << 9) | (1 << 8);
					self.write_block = self.start_block(arg);
					self.write_words_left = blocks * block_size / 4;
					self.write_fifo.clear();
					self.complete();
				}
			}
			_ => {
				// Command the card does not understand.
				self.fail_command(1 << 16);
			}
		}
	}
}

impl MmioIo for EmmcModel {
	fn read32(&self, offset: usize) -> u32 {
		let state = self.state.borrow();
		match offset {
			regs::ARG2 => state.regs.arg2,
			regs::BLKSIZECNT => state.regs.blksizecnt,
			regs::ARG1 => state.regs.arg1,
			regs::RESP0 => state.regs.resp[0],
			regs::RESP1 => state.regs.resp[1],
			regs::RESP2 => state.regs.resp[2],
			regs::RESP3 => state.regs.resp[3],
			regs::DATA => {
				drop(state);
				let mut state = self.state.borrow_mut();
				state.read_fifo.pop_front().map_or(0, |word| {
					if state.read_fifo.is_empty() {
						state.regs.interrupt |= 1 << 1; // transfer complete
					}
					word
				})
			}
			regs::STATUS => state.status_value(),
			regs::CONTROL0 => state.regs.control0,
			regs::CONTROL1 => state.regs.control1,
			regs::CONTROL2 => state.regs.control2,
			regs::INTERRUPT => state.interrupt_value(),
			regs::IRPT_MASK => state.regs.irpt_mask,
			regs::IRPT_EN => state.regs.irpt_en,
			// 100 MHz base clock in the capabilities field.
			regs::CAPABILITIES_0 => 100 << 8,
			regs::CAPABILITIES_1 => 0,
			// Host controller version 3.
			regs::SLOTISR_VER => 3 << 16,
			_ => 0,
		}
	}

	fn write32(&self, offset: usize, value: u32) {
		let mut state = self.state.borrow_mut();
		match offset {
			regs::ARG2 => state.regs.arg2 = value,
			regs::BLKSIZECNT => state.regs.blksizecnt = value,
			regs::ARG1 => state.regs.arg1 = value,
			regs::CMDTM => {
				drop(state);
				self.state.borrow_mut().execute(value);
			}
			regs::DATA => {
				if state.write_words_left > 0 {
					state.write_fifo.push(value);
					state.write_words_left -= 1;
					if state.write_words_left == 0 {
						state.commit_write();
					}
				}
			}
			regs::CONTROL0 => state.regs.control0 = value,
			regs::CONTROL1 => {
				if value & (1 << 24) != 0 {
					// Host reset self-clears instantly.
					state.reset_controller();
					return;
				}
				// CMD/DAT line resets self-clear; the internal clock is
				// stable as soon as it is enabled.
				let mut value = value & !(0x7 << 24);
				if value & 1 != 0 {
					value |= 1 << 1;
				}
				state.regs.control1 = value;
			}
			regs::CONTROL2 => state.regs.control2 = value,
			regs::INTERRUPT => state.regs.interrupt &= !value,
			regs::IRPT_MASK => state.regs.irpt_mask = value,
			regs::IRPT_EN => state.regs.irpt_en = value,
			_ => {}
		}
	}
}
