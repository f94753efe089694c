//! The EMMC host state machine.
//!
//! References: SD Group Physical Layer Simplified Specification 3.00 (PLSS)
//! and Host Controller Simplified Specification 3.00 (HCSS).
//!
//! Register polling here is deliberately synchronous: the block driver
//! handles one request at a time, and every spin is bounded by the
//! command's microsecond budget through [`Deadline`]. Suspension happens
//! only in `delay_micros`.

use std::cell::Cell;
use std::rc::Rc;

use super::mbr;
use super::regs::{self, Interrupt, Status};
use super::{SdConfig, SdError, SdVersion};
use crate::drivers::DriverError;
use crate::sys::dma::{DmaBuffer, DMA_ALIGN};
use crate::sys::mmio::{MmioIo, MmioWindow};
use crate::sys::{Deadline, DeviceNode, Kernel, MBOX_CLOCK_ID_EMMC2, MBOX_DEVICE_ID_SDCARD};

pub const SD_BLOCK_SIZE: usize = 512;

/// Identification-phase clock.
pub const SD_CLOCK_ID: u32 = 400_000;
/// SDR12 data clock.
pub const SD_CLOCK_NORMAL: u32 = 25_000_000;

const CMD_TIMEOUT_USEC: u64 = 500_000;
const DATA_TIMEOUT_USEC: u64 = 5_000_000;
const DATA_RETRIES: u32 = 3;

/// SDMA staging buffer: one aligned host page.
const SDMA_BUFFER_SIZE: usize = 4096;

/// Fallback when the CSD cannot be decoded: 16 GiB of 512-byte blocks.
const DEFAULT_CAPACITY_BLOCKS: u64 = 33_554_432;

/// Wait mask for "command complete or error".
const WAIT_CMD_DONE: u32 = 0x8001;
/// Wait mask for "transfer complete or error".
const WAIT_TRANSFER_DONE: u32 = 0x8002;
/// Wait mask for "transfer complete, DMA interrupt or error".
const WAIT_DMA_DONE: u32 = 0x800a;

/// Direction and buffer of a data command.
enum DataXfer<'a> {
	Read(&'a mut [u8]),
	Write(&'a [u8]),
}

impl DataXfer<'_> {
	fn len(&self) -> usize {
		match self {
			DataXfer::Read(buf) => buf.len(),
			DataXfer::Write(buf) => buf.len(),
		}
	}

	fn is_write(&self) -> bool {
		matches!(self, DataXfer::Write(_))
	}

	fn ptr(&self) -> *const u8 {
		match self {
			DataXfer::Read(buf) => buf.as_ptr(),
			DataXfer::Write(buf) => buf.as_ptr(),
		}
	}
}

/// SD configuration register, read during identification. Big-endian on the
/// wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdScr {
	pub raw: [u32; 2],
	pub bus_widths: u32,
}

pub struct SdHost {
	kernel: Rc<dyn Kernel>,
	regs: Rc<dyn MmioIo>,
	config: SdConfig,

	hci_ver: u32,
	base_clock: u32,

	rca: u32,
	ocr: u32,
	sdhc: bool,
	supports_18v: bool,
	version: SdVersion,
	scr: SdScr,
	cid: [u32; 4],
	csd: [u32; 4],
	capacity_blocks: u64,

	block_size: usize,
	blocks_to_transfer: usize,
	use_sdma: bool,
	dma: Option<DmaBuffer>,

	last_cmd: u32,
	last_cmd_reg: u32,
	last_resp: [u32; 4],
	last_interrupt: u32,
	last_error: u32,

	card_removed: bool,
	abort: Cell<bool>,
}

impl SdHost {
	pub fn new(kernel: Rc<dyn Kernel>, regs: Rc<dyn MmioIo>, config: SdConfig) -> SdHost {
		SdHost {
			kernel,
			regs,
			config,
			hci_ver: 0,
			base_clock: 0,
			rca: 0,
			ocr: 0,
			sdhc: false,
			supports_18v: false,
			version: SdVersion::Unknown,
			scr: SdScr::default(),
			cid: [0; 4],
			csd: [0; 4],
			capacity_blocks: 0,
			block_size: SD_BLOCK_SIZE,
			blocks_to_transfer: 0,
			use_sdma: false,
			dma: None,
			last_cmd: 0,
			last_cmd_reg: 0,
			last_resp: [0; 4],
			last_interrupt: 0,
			last_error: 0,
			card_removed: false,
			abort: Cell::new(false),
		}
	}

	/// Maps the controller window named by the device tree.
	pub fn probe(
		kernel: &Rc<dyn Kernel>,
		node: &DeviceNode,
		config: SdConfig,
	) -> Result<SdHost, DriverError> {
		if !node.compatible.contains("brcm,bcm2711-emmc2") {
			return Err(DriverError::UnsupportedHardware(node.compatible.clone()));
		}
		let regs = MmioWindow::map(&**kernel, node.reg_base, node.reg_size)?;
		Ok(SdHost::new(kernel.clone(), regs, config))
	}

	pub fn block_size(&self) -> usize {
		SD_BLOCK_SIZE
	}

	pub fn capacity_blocks(&self) -> u64 {
		self.capacity_blocks
	}

	pub fn rca(&self) -> u32 {
		self.rca
	}

	pub fn ocr(&self) -> u32 {
		self.ocr
	}

	pub fn is_sdhc(&self) -> bool {
		self.sdhc
	}

	pub fn version(&self) -> SdVersion {
		self.version
	}

	pub fn base_clock(&self) -> u32 {
		self.base_clock
	}

	pub fn last_error(&self) -> u32 {
		self.last_error
	}

	pub fn last_response(&self) -> [u32; 4] {
		self.last_resp
	}

	/// Fails the command in progress (and every later one until the flag is
	/// cleared) with [`SdError::Interrupted`].
	pub fn request_abort(&self) {
		self.abort.set(true);
	}

	pub fn clear_abort(&self) {
		self.abort.set(false);
	}

	fn abort_requested(&self) -> bool {
		self.abort.get() || self.kernel.shutdown_requested()
	}

	/// Polls `cond` until it holds or `usec` elapses on the monotonic
	/// clock. `Ok(false)` is a timeout; an abort fails the poll outright.
	fn timeout_wait(&self, usec: u64, cond: impl Fn() -> bool) -> Result<bool, SdError> {
		let deadline = Deadline::after(&*self.kernel, usec);
		loop {
			if cond() {
				return Ok(true);
			}
			if self.abort_requested() {
				return Err(SdError::Interrupted);
			}
			if deadline.expired(&*self.kernel) {
				return Ok(false);
			}
		}
	}

	fn interrupt_bits(&self) -> u32 {
		self.regs.read32(regs::INTERRUPT)
	}

	// --- controller bring-up (§ HCSS 3.1) ---

	/// Resets the controller and brings the card to transfer state.
	pub fn init(&mut self) -> Result<(), SdError> {
		if self.config.enable_sdma && self.dma.is_none() {
			self.dma = Some(DmaBuffer::new(self.kernel.clone(), SDMA_BUFFER_SIZE)?);
		}
		if self.config.power_cycle {
			self.power_cycle()?;
		}

		let ver = self.regs.read32(regs::SLOTISR_VER);
		self.hci_ver = (ver >> 16) & 0xff;
		info!(
			"sd: vendor {:#x}, host version {}, slot status {:#x}",
			ver >> 24,
			self.hci_ver,
			ver & 0xff
		);
		if self.hci_ver < 2 {
			return Err(SdError::UnsupportedVersion(self.hci_ver));
		}

		// Full controller reset, clock gates off.
		let mut control1 = self.regs.read32(regs::CONTROL1);
		control1 |= regs::C1_SRST_HC;
		control1 &= !(regs::C1_CLK_EN | regs::C1_CLK_INTLEN);
		self.regs.write32(regs::CONTROL1, control1);
		let cleared = self.timeout_wait(1_000_000, || {
			self.regs.read32(regs::CONTROL1) & regs::C1_SRST_MASK == 0
		})?;
		if !cleared {
			return Err(SdError::ResetTimeout);
		}

		let capabilities_0 = self.regs.read32(regs::CAPABILITIES_0);
		let capabilities_1 = self.regs.read32(regs::CAPABILITIES_1);
		debug!("sd: capabilities {capabilities_1:08x}{capabilities_0:08x}");

		// SD bus power at 3.3 V. Voltage switching stays disabled; cards
		// are driven at 3.3 V throughout.
		let control0 = self.regs.read32(regs::CONTROL0) | regs::C0_BUS_POWER_33V;
		self.regs.write32(regs::CONTROL0, control0);
		self.kernel.delay_micros(5_000);

		let inserted = self.timeout_wait(500_000, || {
			Status::from_bits_truncate(self.regs.read32(regs::STATUS))
				.contains(Status::CARD_INSERTED)
		})?;
		if !inserted {
			return Err(SdError::NoCard);
		}

		self.regs.write32(regs::CONTROL2, 0);

		self.base_clock = ((capabilities_0 >> 8) & 0xff) * 1_000_000;
		if self.base_clock == 0 {
			self.base_clock = match self.kernel.clock_rate(MBOX_CLOCK_ID_EMMC2) {
				Ok(rate) => rate,
				Err(_) => {
					warn!("sd: no base clock from capabilities or mailbox, assuming 100 MHz");
					100_000_000
				}
			};
		}
		debug!("sd: base clock {} Hz", self.base_clock);

		// Identification frequency, data timeout at the maximum.
		let divider = self.clock_divider(self.base_clock, SD_CLOCK_ID)?;
		let mut control1 = self.regs.read32(regs::CONTROL1);
		control1 |= regs::C1_CLK_INTLEN;
		control1 &= !regs::C1_CLK_DIVIDER_MASK;
		control1 |= divider;
		control1 &= !regs::C1_DATA_TOUNIT_MASK;
		control1 |= regs::C1_DATA_TOUNIT_MAX;
		self.regs.write32(regs::CONTROL1, control1);

		let stable = self.timeout_wait(1_000_000, || {
			self.regs.read32(regs::CONTROL1) & regs::C1_CLK_STABLE != 0
		})?;
		if !stable {
			return Err(SdError::ClockTimeout);
		}

		self.kernel.delay_micros(2_000);
		let control1 = self.regs.read32(regs::CONTROL1) | regs::C1_CLK_EN;
		self.regs.write32(regs::CONTROL1, control1);
		self.kernel.delay_micros(2_000);

		// Route every event except card-interrupt to the INTERRUPT register
		// and start from a clean slate.
		self.regs.write32(regs::INTERRUPT, 0xffff_ffff);
		self.regs
			.write32(regs::IRPT_MASK, !Interrupt::CARD_INTERRUPT.bits());
		self.kernel.delay_micros(2_000);

		self.rca = 0;
		self.card_removed = false;
		self.block_size = SD_BLOCK_SIZE;
		self.blocks_to_transfer = 0;

		self.identify_card()
	}

	/// Power-cycles the card through the mailbox `SET_POWER_STATE` tag so it
	/// comes up in its startup state.
	fn power_cycle(&mut self) -> Result<(), SdError> {
		let off = self.kernel.set_power_state(MBOX_DEVICE_ID_SDCARD, false)?;
		if off {
			warn!("sd: card did not report power-off");
		}
		self.kernel.delay_micros(5_000);
		let on = self.kernel.set_power_state(MBOX_DEVICE_ID_SDCARD, true)?;
		if !on {
			return Err(SdError::Identification("card did not power on"));
		}
		Ok(())
	}

	/// Card identification sequence (PLSS 4.2).
	fn identify_card(&mut self) -> Result<(), SdError> {
		self.issue_command(regs::GO_IDLE_STATE, 0, 1_500_000)
			.map_err(|err| {
				error!("sd: no CMD0 response: {err}");
				SdError::Identification("no response to GO_IDLE_STATE")
			})?;

		// CMD8: voltage 2.7-3.6 V, check pattern 0xAA (PLSS 4.3.13). V1
		// cards time out here.
		let v2_later = match self.issue_command(regs::SEND_IF_COND, 0x1aa, CMD_TIMEOUT_USEC) {
			Ok(()) => {
				if self.last_resp[0] & 0xfff != 0x1aa {
					return Err(SdError::UnusableCard(self.last_resp[0]));
				}
				true
			}
			Err(SdError::Timeout { .. }) => {
				self.reset_cmd_line()?;
				false
			}
			Err(SdError::Command { interrupt, .. })
				if interrupt & Interrupt::CMD_TIMEOUT.bits() != 0 =>
			{
				self.reset_cmd_line()?;
				self.regs
					.write32(regs::INTERRUPT, Interrupt::CMD_TIMEOUT.bits());
				false
			}
			Err(err) => return Err(err),
		};

		// CMD5 answers only on SDIO cards (HCSS 3.6), which this driver
		// does not speak.
		match self.issue_command(regs::IO_SET_OP_COND, 0, 10_000) {
			Err(SdError::Timeout { .. }) => {}
			Err(SdError::Command { interrupt, .. })
				if interrupt & Interrupt::CMD_TIMEOUT.bits() != 0 =>
			{
				self.reset_cmd_line()?;
				self.regs
					.write32(regs::INTERRUPT, Interrupt::CMD_TIMEOUT.bits());
			}
			Err(err @ (SdError::Interrupted | SdError::CardRemoved)) => return Err(err),
			_ => return Err(SdError::SdioCard),
		}

		// Inquiry ACMD41 reads the OCR without starting initialisation.
		self.issue_command(regs::SD_SEND_OP_COND, 0, CMD_TIMEOUT_USEC)
			.map_err(|_| SdError::Identification("inquiry ACMD41 failed"))?;
		debug!("sd: inquiry ACMD41 OCR {:#010x}", self.last_resp[0]);

		loop {
			let mut arg = 0x00ff_8000;
			if v2_later {
				// Announce SDHC support. 1.8 V signalling is never
				// requested.
				arg |= 1 << 30;
			}
			self.issue_command(regs::SD_SEND_OP_COND, arg, CMD_TIMEOUT_USEC)
				.map_err(|_| SdError::Identification("init ACMD41 failed"))?;

			if self.last_resp[0] >> 31 & 0x1 != 0 {
				self.ocr = (self.last_resp[0] >> 8) & 0xffff;
				self.sdhc = v2_later && (self.last_resp[0] >> 30) & 0x1 != 0;
				self.supports_18v = false;
				break;
			}
			if self.abort_requested() {
				return Err(SdError::Interrupted);
			}
			debug!("sd: card busy, retrying ACMD41");
			self.kernel.delay_micros(500_000);
		}
		debug!(
			"sd: OCR {:#06x}, SDHC {}, 1.8V {}",
			self.ocr, self.sdhc, self.supports_18v
		);

		self.issue_command(regs::ALL_SEND_CID, 0, CMD_TIMEOUT_USEC)
			.map_err(|_| SdError::Identification("ALL_SEND_CID failed"))?;
		self.cid = self.last_resp;
		info!(
			"sd: card CID {:08x}{:08x}{:08x}{:08x}",
			self.cid[3], self.cid[2], self.cid[1], self.cid[0]
		);

		self.issue_command(regs::SEND_RELATIVE_ADDR, 0, CMD_TIMEOUT_USEC)
			.map_err(|_| SdError::Identification("SEND_RELATIVE_ADDR failed"))?;
		let cmd3_resp = self.last_resp[0];
		let crc_error = (cmd3_resp >> 15) & 0x1 != 0;
		let illegal_cmd = (cmd3_resp >> 14) & 0x1 != 0;
		let generic_error = (cmd3_resp >> 13) & 0x1 != 0;
		let ready = (cmd3_resp >> 8) & 0x1 != 0;
		if crc_error || illegal_cmd || generic_error || !ready {
			return Err(SdError::Identification("bad SEND_RELATIVE_ADDR status"));
		}
		self.rca = (cmd3_resp >> 16) & 0xffff;
		debug!("sd: RCA {:#06x}", self.rca);

		// CSD while still in standby; sizes the whole-device mount.
		self.issue_command(regs::SEND_CSD, self.rca << 16, CMD_TIMEOUT_USEC)
			.map_err(|_| SdError::Identification("SEND_CSD failed"))?;
		self.csd = self.last_resp;
		self.capacity_blocks = match self.decode_csd_capacity() {
			Some(blocks) => blocks,
			None => {
				warn!("sd: cannot decode CSD, assuming 16 GiB");
				DEFAULT_CAPACITY_BLOCKS
			}
		};
		info!("sd: capacity {} blocks", self.capacity_blocks);

		self.issue_command(regs::SELECT_CARD, self.rca << 16, CMD_TIMEOUT_USEC)
			.map_err(|_| SdError::Identification("SELECT_CARD failed"))?;
		let state = (self.last_resp[0] >> 9) & 0xf;
		if state != 3 && state != 4 {
			return Err(SdError::BadCardState(state));
		}

		// PLSS table 4.20: legacy cards need the block length set; SDHC is
		// fixed at 512.
		if !self.sdhc {
			self.issue_command(regs::SET_BLOCKLEN, SD_BLOCK_SIZE as u32, CMD_TIMEOUT_USEC)
				.map_err(|_| SdError::Identification("SET_BLOCKLEN failed"))?;
		}
		let mut blksizecnt = self.regs.read32(regs::BLKSIZECNT);
		blksizecnt &= !0xfff;
		blksizecnt |= SD_BLOCK_SIZE as u32;
		self.regs.write32(regs::BLKSIZECNT, blksizecnt);

		// SCR: one 8-byte data read.
		let mut scr_bytes = [0u8; 8];
		self.block_size = 8;
		self.blocks_to_transfer = 1;
		let scr_result = self.issue_command_data(
			regs::SEND_SCR,
			0,
			CMD_TIMEOUT_USEC,
			Some(DataXfer::Read(&mut scr_bytes)),
		);
		self.block_size = SD_BLOCK_SIZE;
		scr_result.map_err(|_| SdError::Identification("SEND_SCR failed"))?;

		self.scr.raw = [
			u32::from_le_bytes(scr_bytes[0..4].try_into().unwrap()),
			u32::from_le_bytes(scr_bytes[4..8].try_into().unwrap()),
		];
		let scr0 = self.scr.raw[0].swap_bytes();
		self.scr.bus_widths = (scr0 >> 16) & 0xf;
		let sd_spec = (scr0 >> 24) & 0xf;
		let sd_spec3 = (scr0 >> 15) & 0x1;
		let sd_spec4 = (scr0 >> 10) & 0x1;
		self.version = match (sd_spec, sd_spec3, sd_spec4) {
			(0, _, _) => SdVersion::V1,
			(1, _, _) => SdVersion::V1_1,
			(2, 0, _) => SdVersion::V2,
			(2, 1, 0) => SdVersion::V3,
			(2, 1, 1) => SdVersion::V4,
			_ => SdVersion::Unknown,
		};
		info!(
			"sd: version {} card, bus widths {:#x}",
			self.version, self.scr.bus_widths
		);

		// Identification done; data transfers run at SDR12.
		self.switch_clock_rate(SD_CLOCK_NORMAL)?;
		self.kernel.delay_micros(20_000);

		self.regs.write32(regs::INTERRUPT, 0xffff_ffff);
		Ok(())
	}

	/// Whole-device capacity in 512-byte blocks from the CSD (PLSS 5.3).
	fn decode_csd_capacity(&self) -> Option<u64> {
		// RESP0..3 hold CSD bits [127:8].
		let structure = (self.csd[3] >> 22) & 0x3;
		match structure {
			0 => {
				let read_bl_len = (self.csd[2] >> 8) & 0xf;
				let c_size = ((self.csd[2] & 0x3) << 10) | (self.csd[1] >> 22);
				let c_size_mult = (self.csd[1] >> 7) & 0x7;
				let bytes =
					u64::from(c_size + 1) << (c_size_mult + 2) << read_bl_len;
				Some(bytes / SD_BLOCK_SIZE as u64)
			}
			1 => {
				let c_size = u64::from((self.csd[1] >> 8) & 0x3f_ffff);
				Some((c_size + 1) * 1024)
			}
			_ => None,
		}
	}

	// --- clocking (HCSS 2.2.14) ---

	/// Encodes the CONTROL1 divider field for `target` Hz.
	fn clock_divider(&self, base_clock: u32, target: u32) -> Result<u32, SdError> {
		if target == 0 {
			return Err(SdError::Identification("zero target clock"));
		}
		let closest = (base_clock + target / 2) / target;

		let divisor = if self.hci_ver >= 3 {
			// 10-bit divided clock mode takes the quotient directly.
			closest.clamp(2, 0x3ff)
		} else {
			// 8-bit mode needs a power of two, at most 256.
			let mut divisor = 1u32;
			while divisor < closest && divisor < 256 {
				divisor <<= 1;
			}
			divisor
		};

		Ok(((divisor & 0xff) << 8) | (((divisor >> 8) & 0x3) << 6))
	}

	/// Re-clocks a running bus (HCSS 3.2.3).
	fn switch_clock_rate(&mut self, target: u32) -> Result<(), SdError> {
		let divider = self.clock_divider(self.base_clock, target)?;

		let idle = self.timeout_wait(1_000_000, || {
			!Status::from_bits_truncate(self.regs.read32(regs::STATUS))
				.intersects(Status::CMD_INHIBIT | Status::DAT_INHIBIT)
		})?;
		if !idle {
			return Err(SdError::Timeout {
				cmd: self.last_cmd,
			});
		}

		let mut control1 = self.regs.read32(regs::CONTROL1);
		control1 &= !regs::C1_CLK_EN;
		self.regs.write32(regs::CONTROL1, control1);

		control1 &= !regs::C1_CLK_DIVIDER_MASK;
		control1 |= divider;
		self.regs.write32(regs::CONTROL1, control1);
		self.kernel.delay_micros(2_000);

		control1 |= regs::C1_CLK_EN;
		self.regs.write32(regs::CONTROL1, control1);
		self.kernel.delay_micros(2_000);

		debug!("sd: clock rate set to {target} Hz");
		Ok(())
	}

	fn reset_cmd_line(&mut self) -> Result<(), SdError> {
		let control1 = self.regs.read32(regs::CONTROL1) | regs::C1_SRST_CMD;
		self.regs.write32(regs::CONTROL1, control1);
		let cleared = self.timeout_wait(1_000_000, || {
			self.regs.read32(regs::CONTROL1) & regs::C1_SRST_CMD == 0
		})?;
		if !cleared {
			error!("sd: CMD line did not reset");
			return Err(SdError::ResetTimeout);
		}
		Ok(())
	}

	fn reset_dat_line(&mut self) -> Result<(), SdError> {
		let control1 = self.regs.read32(regs::CONTROL1) | regs::C1_SRST_DAT;
		self.regs.write32(regs::CONTROL1, control1);
		let cleared = self.timeout_wait(1_000_000, || {
			self.regs.read32(regs::CONTROL1) & regs::C1_SRST_DAT == 0
		})?;
		if !cleared {
			warn!("sd: DAT line did not reset");
			return Err(SdError::ResetTimeout);
		}
		Ok(())
	}

	// --- interrupt servicing ---

	/// Acknowledges pending host interrupts, clearing only understood bits.
	/// Card removal poisons the device until the next re-init.
	fn handle_interrupts(&mut self) {
		let pending = Interrupt::from_bits_retain(self.interrupt_bits());
		let mut reset = Interrupt::empty();

		if pending.contains(Interrupt::CMD_DONE) {
			trace!("sd: spurious command complete");
			reset |= Interrupt::CMD_DONE;
		}
		if pending.contains(Interrupt::TRANSFER_DONE) {
			trace!("sd: spurious transfer complete");
			reset |= Interrupt::TRANSFER_DONE;
		}
		if pending.contains(Interrupt::BLOCK_GAP) {
			reset |= Interrupt::BLOCK_GAP;
		}
		if pending.contains(Interrupt::DMA) {
			reset |= Interrupt::DMA;
		}
		if pending.contains(Interrupt::WRITE_READY) {
			reset |= Interrupt::WRITE_READY;
			let _ = self.reset_dat_line();
		}
		if pending.contains(Interrupt::READ_READY) {
			reset |= Interrupt::READ_READY;
			let _ = self.reset_dat_line();
		}
		if pending.contains(Interrupt::CARD_INSERTION) {
			info!("sd: card insertion detected");
			reset |= Interrupt::CARD_INSERTION;
		}
		if pending.contains(Interrupt::CARD_REMOVAL) {
			warn!("sd: card removal detected");
			reset |= Interrupt::CARD_REMOVAL;
			self.card_removed = true;
		}
		if pending.contains(Interrupt::CARD_INTERRUPT) {
			self.handle_card_interrupt();
			reset |= Interrupt::CARD_INTERRUPT;
		}
		if pending.contains(Interrupt::ERR) {
			warn!("sd: spurious error interrupt {:#010x}", pending.bits());
			reset |= Interrupt::from_bits_retain(super::regs::INT_ERROR_MASK);
		}

		self.regs.write32(regs::INTERRUPT, reset.bits());
	}

	fn handle_card_interrupt(&mut self) {
		if self.rca == 0 {
			warn!("sd: card interrupt with no card selected");
			return;
		}
		let status = self.issue_command_raw(
			regs::SEND_STATUS,
			regs::COMMANDS[regs::SEND_STATUS as usize],
			self.rca << 16,
			CMD_TIMEOUT_USEC,
			None,
		);
		match status {
			Ok(()) => debug!("sd: card status {:#010x}", self.last_resp[0]),
			Err(err) => warn!("sd: cannot read card status: {err}"),
		}
	}

	// --- command issue (HCSS 3.7) ---

	/// Issues a command without data. ACMDs carry [`regs::IS_APP_CMD`] and
	/// are preceded by APP_CMD.
	pub fn issue_command(&mut self, command: u32, arg: u32, timeout_usec: u64) -> Result<(), SdError> {
		self.issue_command_data(command, arg, timeout_usec, None)
	}

	fn issue_command_data(
		&mut self,
		command: u32,
		arg: u32,
		timeout_usec: u64,
		data: Option<DataXfer<'_>>,
	) -> Result<(), SdError> {
		self.handle_interrupts();
		if self.card_removed {
			return Err(SdError::CardRemoved);
		}

		if command & regs::IS_APP_CMD != 0 {
			let index = (command & 0xff) as usize;
			let cmd_reg = regs::APP_COMMANDS[index];
			if cmd_reg == regs::CMD_RESERVED {
				return Err(SdError::InvalidCommand(command));
			}

			let rca_arg = if self.rca != 0 { self.rca << 16 } else { 0 };
			self.last_cmd = regs::APP_CMD;
			self.issue_command_raw(
				regs::APP_CMD,
				regs::COMMANDS[regs::APP_CMD as usize],
				rca_arg,
				timeout_usec,
				None,
			)?;

			self.last_cmd = command;
			self.issue_command_raw(index as u32, cmd_reg, arg, timeout_usec, data)
		} else {
			let index = (command & 0xff) as usize;
			let cmd_reg = regs::COMMANDS[index];
			if cmd_reg == regs::CMD_RESERVED {
				return Err(SdError::InvalidCommand(command));
			}

			self.last_cmd = command;
			self.issue_command_raw(command, cmd_reg, arg, timeout_usec, data)
		}
	}

	/// The HCSS 3.7.1.1 single-command sequence.
	fn issue_command_raw(
		&mut self,
		cmd_index: u32,
		cmd_reg: u32,
		arg: u32,
		timeout_usec: u64,
		mut data: Option<DataXfer<'_>>,
	) -> Result<(), SdError> {
		self.last_cmd_reg = cmd_reg;
		self.last_error = 0;
		self.last_interrupt = 0;

		let fail = |host: &mut Self, irpts: u32| -> SdError {
			host.last_error = irpts & regs::INT_ERROR_MASK;
			host.last_interrupt = irpts;
			if irpts == 0 {
				SdError::Timeout { cmd: cmd_index }
			} else {
				SdError::Command {
					cmd: cmd_index,
					interrupt: irpts,
				}
			}
		};

		// Wait for command inhibit; with-busy non-abort commands also wait
		// for the data line.
		let ready = self.timeout_wait(timeout_usec, || {
			!Status::from_bits_truncate(self.regs.read32(regs::STATUS))
				.contains(Status::CMD_INHIBIT)
		})?;
		if !ready {
			return Err(fail(self, 0));
		}
		if cmd_reg & regs::TM_RSPNS_MASK == regs::TM_RSPNS_48_BUSY
			&& cmd_reg & regs::TM_CMD_TYPE_MASK != regs::TM_CMD_TYPE_ABORT
		{
			let ready = self.timeout_wait(timeout_usec, || {
				!Status::from_bits_truncate(self.regs.read32(regs::STATUS))
					.contains(Status::DAT_INHIBIT)
			})?;
			if !ready {
				return Err(fail(self, 0));
			}
		}

		let is_data = cmd_reg & regs::TM_CMD_ISDATA != 0;
		let is_sdma = is_data && self.use_sdma && data.is_some();

		if let Some(xfer) = &data {
			self.blocks_to_transfer = xfer.len() / self.block_size;
		}
		if self.blocks_to_transfer > 0xffff {
			return Err(SdError::TooManyBlocks(self.blocks_to_transfer));
		}

		if is_sdma {
			// SDMA system address (ARG2); stage write data and flush the
			// cache before the controller reads it.
			let dma = self.dma.as_mut().expect("sdma enabled without a buffer");
			if let Some(DataXfer::Write(buf)) = &data {
				dma.as_mut_slice()[..buf.len()].copy_from_slice(buf);
				dma.flush();
			}
			let paddr = dma.paddr();
			self.regs.write32(regs::ARG2, paddr as u32);
		}

		let blksizecnt = self.block_size as u32 | (self.blocks_to_transfer as u32) << 16;
		self.regs.write32(regs::BLKSIZECNT, blksizecnt);
		self.regs.write32(regs::ARG1, arg);

		let mut cmd_reg = cmd_reg;
		if is_sdma {
			cmd_reg |= regs::TM_DMA_EN;
		}
		self.regs.write32(regs::CMDTM, cmd_reg);

		// Command complete or error.
		let done = self.timeout_wait(timeout_usec, || {
			self.interrupt_bits() & WAIT_CMD_DONE != 0
		})?;
		let irpts = self.interrupt_bits();
		self.regs.write32(regs::INTERRUPT, 0xffff_0001);
		if !done || irpts & 0xffff_0001 != Interrupt::CMD_DONE.bits() {
			return Err(fail(self, irpts));
		}

		match cmd_reg & regs::TM_RSPNS_MASK {
			regs::TM_RSPNS_48 | regs::TM_RSPNS_48_BUSY => {
				self.last_resp[0] = self.regs.read32(regs::RESP0);
			}
			regs::TM_RSPNS_136 => {
				self.last_resp = [
					self.regs.read32(regs::RESP0),
					self.regs.read32(regs::RESP1),
					self.regs.read32(regs::RESP2),
					self.regs.read32(regs::RESP3),
				];
			}
			_ => {}
		}

		// PIO block transfer through the DATA register.
		if is_data && !is_sdma {
			if let Some(xfer) = &mut data {
				let ready_bit = if xfer.is_write() {
					Interrupt::WRITE_READY
				} else {
					Interrupt::READ_READY
				};
				let wait_mask = ready_bit.bits() | Interrupt::ERR.bits();

				for block in 0..self.blocks_to_transfer {
					let ready = self.timeout_wait(timeout_usec, || {
						self.interrupt_bits() & wait_mask != 0
					})?;
					let irpts = self.interrupt_bits();
					self.regs
						.write32(regs::INTERRUPT, regs::INT_ERROR_MASK | ready_bit.bits());
					if !ready || irpts & (regs::INT_ERROR_MASK | ready_bit.bits()) != ready_bit.bits()
					{
						return Err(fail(self, irpts));
					}

					let offset = block * self.block_size;
					match xfer {
						DataXfer::Read(buf) => {
							for word in buf[offset..offset + self.block_size].chunks_exact_mut(4) {
								let value = self.regs.read32(regs::DATA);
								word.copy_from_slice(&value.to_le_bytes());
							}
						}
						DataXfer::Write(buf) => {
							for word in buf[offset..offset + self.block_size].chunks_exact(4) {
								let value = u32::from_le_bytes(word.try_into().unwrap());
								self.regs.write32(regs::DATA, value);
							}
						}
					}
				}
			}
		}

		let with_busy = cmd_reg & regs::TM_RSPNS_MASK == regs::TM_RSPNS_48_BUSY;
		if (with_busy || is_data) && !is_sdma {
			// Transfer complete; HCSS 2.2.17: transfer-complete wins over a
			// simultaneous data-timeout.
			if !Status::from_bits_truncate(self.regs.read32(regs::STATUS))
				.contains(Status::DAT_INHIBIT)
			{
				self.regs.write32(regs::INTERRUPT, 0xffff_0002);
			} else {
				let done = self.timeout_wait(timeout_usec, || {
					self.interrupt_bits() & WAIT_TRANSFER_DONE != 0
				})?;
				let irpts = self.interrupt_bits();
				self.regs.write32(regs::INTERRUPT, 0xffff_0002);
				let masked = irpts & 0xffff_0002;
				if !done
					|| (masked != Interrupt::TRANSFER_DONE.bits()
						&& masked
							!= (Interrupt::TRANSFER_DONE | Interrupt::DATA_TIMEOUT).bits())
				{
					return Err(fail(self, irpts));
				}
				self.regs.write32(regs::INTERRUPT, 0xffff_0002);
			}
		} else if is_sdma {
			self.finish_sdma(cmd_index, timeout_usec, &mut data, fail)?;
		}

		Ok(())
	}

	/// Completion of an SDMA transfer: transfer-complete, DMA interrupt or
	/// error.
	fn finish_sdma(
		&mut self,
		cmd_index: u32,
		timeout_usec: u64,
		data: &mut Option<DataXfer<'_>>,
		fail: impl Fn(&mut Self, u32) -> SdError,
	) -> Result<(), SdError> {
		if !Status::from_bits_truncate(self.regs.read32(regs::STATUS))
			.contains(Status::DAT_INHIBIT)
		{
			self.regs.write32(regs::INTERRUPT, 0xffff_000a);
		} else {
			let done = self.timeout_wait(timeout_usec, || {
				self.interrupt_bits() & WAIT_DMA_DONE != 0
			})?;
			let irpts = self.interrupt_bits();
			self.regs.write32(regs::INTERRUPT, 0xffff_000a);

			let transfer_done = irpts & Interrupt::TRANSFER_DONE.bits() != 0;
			if irpts & Interrupt::ERR.bits() != 0 && !transfer_done {
				return Err(fail(self, irpts));
			}
			// A DMA boundary interrupt without transfer-complete means the
			// transfer outgrew the buffer; unsupported.
			if irpts & Interrupt::DMA.bits() != 0 && !transfer_done {
				error!("sd: DMA interrupt without transfer complete");
				return Err(fail(self, irpts));
			}
			if !transfer_done {
				if !done {
					error!("sd: timeout waiting for SDMA completion");
				}
				if irpts == 0
					&& Status::from_bits_truncate(self.regs.read32(regs::STATUS))
						.contains(Status::DAT_INHIBIT)
				{
					// Transfer still in flight; abort it.
					warn!("sd: aborting stuck SDMA transfer");
					self.regs.write32(
						regs::CMDTM,
						regs::COMMANDS[regs::STOP_TRANSMISSION as usize],
					);
				}
				return Err(fail(self, irpts));
			}
		}

		if let Some(DataXfer::Read(buf)) = data {
			let dma = self.dma.as_mut().expect("sdma enabled without a buffer");
			dma.invalidate();
			let len = buf.len();
			buf.copy_from_slice(&dma.as_slice()[..len]);
		}
		Ok(())
	}

	// --- data path (§ PLSS 4.3.3) ---

	/// Brings the card to transfer state, re-initialising when required
	/// (card replaced, or left in an unexpected state).
	fn ensure_data_mode(&mut self) -> Result<(), SdError> {
		if self.rca == 0 {
			self.init()?;
		}

		self.issue_command(regs::SEND_STATUS, self.rca << 16, CMD_TIMEOUT_USEC)
			.map_err(|err| {
				self.rca = 0;
				err
			})?;
		let state = (self.last_resp[0] >> 9) & 0xf;

		match state {
			3 => {
				// Standby; select the card.
				self.issue_command(regs::SELECT_CARD, self.rca << 16, CMD_TIMEOUT_USEC)
					.map_err(|err| {
						self.rca = 0;
						err
					})?;
			}
			5 => {
				// Data state; cancel the stuck transfer.
				self.issue_command(regs::STOP_TRANSMISSION, 0, CMD_TIMEOUT_USEC)
					.map_err(|err| {
						self.rca = 0;
						err
					})?;
				self.reset_dat_line()?;
			}
			4 => return Ok(()),
			_ => {
				self.init()?;
			}
		}

		self.issue_command(regs::SEND_STATUS, self.rca << 16, CMD_TIMEOUT_USEC)
			.map_err(|err| {
				self.rca = 0;
				err
			})?;
		let state = (self.last_resp[0] >> 9) & 0xf;
		if state != 4 {
			self.rca = 0;
			return Err(SdError::BadCardState(state));
		}
		Ok(())
	}

	fn check_data_buffer(&mut self, len: usize) -> Result<(), SdError> {
		// HCSS 3.7.2.1: whole blocks only.
		if len < self.block_size || len % self.block_size != 0 {
			return Err(SdError::BadBufferSize(len));
		}
		Ok(())
	}

	/// Block address for the card: byte-addressed below SDHC (PLSS table
	/// 4.20).
	fn card_address(&self, block_no: u32) -> u32 {
		if self.sdhc {
			block_no
		} else {
			block_no * SD_BLOCK_SIZE as u32
		}
	}

	fn sdma_usable(&self, xfer: &DataXfer<'_>) -> bool {
		self.config.enable_sdma
			&& self.dma.is_some()
			&& xfer.ptr() as usize % DMA_ALIGN == 0
			&& xfer.len() <= self.dma.as_ref().map_or(0, DmaBuffer::len)
	}

	/// Reads whole blocks starting at `block_no`. Returns bytes read.
	pub fn read(&mut self, buf: &mut [u8], block_no: u32) -> Result<usize, SdError> {
		self.ensure_data_mode()?;
		self.check_data_buffer(buf.len())?;

		let blocks = buf.len() / self.block_size;
		let command = if blocks > 1 {
			regs::READ_MULTIPLE_BLOCK
		} else {
			regs::READ_SINGLE_BLOCK
		};
		let address = self.card_address(block_no);

		let mut attempt = 0;
		loop {
			self.use_sdma = attempt == 0 && self.sdma_usable(&DataXfer::Read(&mut *buf));
			let result = self.issue_command_data(
				command,
				address,
				DATA_TIMEOUT_USEC,
				Some(DataXfer::Read(&mut *buf)),
			);
			match result {
				Ok(()) => return Ok(buf.len()),
				Err(err) => {
					attempt += 1;
					warn!(
						"sd: CMD{command} failed (attempt {attempt}/{DATA_RETRIES}): {err}"
					);
					if attempt >= DATA_RETRIES {
						self.rca = 0;
						return Err(err);
					}
				}
			}
		}
	}

	/// Writes whole blocks starting at `block_no`. Returns bytes written.
	pub fn write(&mut self, buf: &[u8], block_no: u32) -> Result<usize, SdError> {
		self.ensure_data_mode()?;
		self.check_data_buffer(buf.len())?;

		let blocks = buf.len() / self.block_size;
		let command = if blocks > 1 {
			regs::WRITE_MULTIPLE_BLOCK
		} else {
			regs::WRITE_BLOCK
		};
		let address = self.card_address(block_no);

		let mut attempt = 0;
		loop {
			self.use_sdma = attempt == 0 && self.sdma_usable(&DataXfer::Write(buf));
			let result = self.issue_command_data(
				command,
				address,
				DATA_TIMEOUT_USEC,
				Some(DataXfer::Write(buf)),
			);
			match result {
				Ok(()) => return Ok(buf.len()),
				Err(err) => {
					attempt += 1;
					warn!(
						"sd: CMD{command} failed (attempt {attempt}/{DATA_RETRIES}): {err}"
					);
					if attempt >= DATA_RETRIES {
						self.rca = 0;
						return Err(err);
					}
				}
			}
		}
	}

	/// Reads sector 0 and returns the MBR partition entries.
	pub fn read_partition_table(&mut self) -> Result<[mbr::PartitionEntry; 4], SdError> {
		let mut sector = [0u8; SD_BLOCK_SIZE];
		self.read(&mut sector, 0)?;
		Ok(mbr::partition_entries(&sector))
	}

	/// Attaches the SDMA staging buffer.
	pub fn set_dma_buffer(&mut self, dma: DmaBuffer) {
		self.dma = Some(dma);
	}

	/// Human-readable register dump for the `debug` sendmsg command.
	pub fn dump_registers(&self) -> String {
		format!(
			"STATUS:     {:#010x}\nCONTROL0:   {:#010x}\nCONTROL1:   {:#010x}\n\
			 INTERRUPT:  {:#010x}\nIRPT_MASK:  {:#010x}\nBLKSIZECNT: {:#010x}\n\
			 last cmd:   CMD{} (reg {:#010x})\nlast irpt:  {:#010x}\nlast error: {:#010x}\n",
			self.regs.read32(regs::STATUS),
			self.regs.read32(regs::CONTROL0),
			self.regs.read32(regs::CONTROL1),
			self.regs.read32(regs::INTERRUPT),
			self.regs.read32(regs::IRPT_MASK),
			self.regs.read32(regs::BLKSIZECNT),
			self.last_cmd & 0xff,
			self.last_cmd_reg,
			self.last_interrupt,
			self.last_error,
		)
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use super::*;
	use crate::sys::mock::MockKernel;

	struct NullRegs(RefCell<[u32; 0x40]>);

	impl MmioIo for NullRegs {
		fn read32(&self, offset: usize) -> u32 {
			self.0.borrow()[offset / 4]
		}

		fn write32(&self, offset: usize, value: u32) {
			self.0.borrow_mut()[offset / 4] = value;
		}
	}

	fn host_with_version(hci_ver: u32) -> SdHost {
		let kernel: Rc<dyn Kernel> = Rc::new(MockKernel::new());
		let regs = Rc::new(NullRegs(RefCell::new([0; 0x40])));
		let mut host = SdHost::new(kernel, regs, SdConfig::default());
		host.hci_ver = hci_ver;
		host
	}

	#[test]
	fn divider_for_host_v3_uses_rounded_quotient() {
		let host = host_with_version(3);
		// 100 MHz / 400 kHz = 250 -> low byte 0xfa in CONTROL1[15:8].
		assert_eq!(host.clock_divider(100_000_000, 400_000).unwrap(), 0xfa00);
		// 100 MHz / 25 MHz = 4.
		assert_eq!(host.clock_divider(100_000_000, 25_000_000).unwrap(), 0x0400);
		// Quotient below the minimum clamps to 2.
		assert_eq!(
			host.clock_divider(100_000_000, 100_000_000).unwrap(),
			0x0200
		);
		// A 10-bit divisor spills into CONTROL1[7:6].
		let encoded = host.clock_divider(100_000_000, 120_000).unwrap();
		// 100 MHz / 120 kHz rounds to 833 = 0b11_0100_0001.
		assert_eq!(encoded, (0x41 << 8) | (0x3 << 6));
	}

	#[test]
	fn divider_for_older_hosts_is_a_power_of_two() {
		let host = host_with_version(2);
		// 250 rounds up to 256, whose low byte is zero with bit 8 in [7:6].
		assert_eq!(host.clock_divider(100_000_000, 400_000).unwrap(), 1 << 6);
		// 4 stays 4.
		assert_eq!(host.clock_divider(100_000_000, 25_000_000).unwrap(), 0x0400);
	}

	#[test]
	fn csd_v2_capacity() {
		let mut host = host_with_version(3);
		// CSD_STRUCTURE = 1 (v2), C_SIZE = 0x1f (32 KiB * 1024 blocks).
		host.csd = [0, 0x1f << 8, 0, 1 << 22];
		assert_eq!(host.decode_csd_capacity(), Some(0x20 * 1024));
	}

	#[test]
	fn csd_v1_capacity() {
		let mut host = host_with_version(3);
		// READ_BL_LEN = 9, C_SIZE = 1000, C_SIZE_MULT = 5.
		let c_size: u32 = 1000;
		host.csd = [
			0,
			(c_size << 22) | (5 << 7),
			(c_size >> 10) & 0x3 | (9 << 8),
			0,
		];
		// (1001 << 7) << 9 bytes = 1001 * 128 blocks.
		assert_eq!(host.decode_csd_capacity(), Some(1001 * 128));
	}
}
