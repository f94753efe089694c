//! EMMC host controller registers (HCSS 3.00 layout, BCM2711 emmc2 block).

use bitflags::bitflags;

pub const ARG2: usize = 0x00;
pub const BLKSIZECNT: usize = 0x04;
pub const ARG1: usize = 0x08;
pub const CMDTM: usize = 0x0c;
pub const RESP0: usize = 0x10;
pub const RESP1: usize = 0x14;
pub const RESP2: usize = 0x18;
pub const RESP3: usize = 0x1c;
pub const DATA: usize = 0x20;
pub const STATUS: usize = 0x24;
pub const CONTROL0: usize = 0x28;
pub const CONTROL1: usize = 0x2c;
pub const INTERRUPT: usize = 0x30;
pub const IRPT_MASK: usize = 0x34;
pub const IRPT_EN: usize = 0x38;
pub const CONTROL2: usize = 0x3c;
pub const CAPABILITIES_0: usize = 0x40;
pub const CAPABILITIES_1: usize = 0x44;
pub const SLOTISR_VER: usize = 0xfc;

bitflags! {
	/// STATUS register.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Status: u32 {
		const CMD_INHIBIT = 1 << 0;
		const DAT_INHIBIT = 1 << 1;
		const DAT_ACTIVE = 1 << 2;
		const CARD_INSERTED = 1 << 16;
	}
}

/// CONTROL0: SD bus power at VDD1 3.3 V.
pub const C0_BUS_POWER_33V: u32 = 0xf << 8;

/// CONTROL1 bits.
pub const C1_CLK_INTLEN: u32 = 1 << 0;
pub const C1_CLK_STABLE: u32 = 1 << 1;
pub const C1_CLK_EN: u32 = 1 << 2;
/// Divider field, CONTROL1[15:6].
pub const C1_CLK_DIVIDER_MASK: u32 = 0x3ff << 6;
pub const C1_DATA_TOUNIT_MASK: u32 = 0xf << 16;
/// TMCLK * 2^24.
pub const C1_DATA_TOUNIT_MAX: u32 = 11 << 16;
pub const C1_SRST_HC: u32 = 1 << 24;
pub const C1_SRST_CMD: u32 = 1 << 25;
pub const C1_SRST_DAT: u32 = 1 << 26;
pub const C1_SRST_MASK: u32 = 0x7 << 24;

bitflags! {
	/// INTERRUPT register; the error summary lives in the top half.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct Interrupt: u32 {
		const CMD_DONE = 1 << 0;
		const TRANSFER_DONE = 1 << 1;
		const BLOCK_GAP = 1 << 2;
		const DMA = 1 << 3;
		const WRITE_READY = 1 << 4;
		const READ_READY = 1 << 5;
		const CARD_INSERTION = 1 << 6;
		const CARD_REMOVAL = 1 << 7;
		const CARD_INTERRUPT = 1 << 8;
		const ERR = 1 << 15;
		const CMD_TIMEOUT = 1 << 16;
		const CMD_CRC = 1 << 17;
		const CMD_END_BIT = 1 << 18;
		const CMD_INDEX = 1 << 19;
		const DATA_TIMEOUT = 1 << 20;
		const DATA_CRC = 1 << 21;
		const DATA_END_BIT = 1 << 22;
		const CURRENT_LIMIT = 1 << 23;
		const AUTO_CMD12 = 1 << 24;
		const ADMA = 1 << 25;
		const TUNING = 1 << 26;
	}
}

/// The error half of the INTERRUPT register.
pub const INT_ERROR_MASK: u32 = 0xffff_0000;

/// CMDTM encoding.
pub const TM_CMD_TYPE_ABORT: u32 = 3 << 22;
pub const TM_CMD_TYPE_MASK: u32 = 3 << 22;
pub const TM_CMD_ISDATA: u32 = 1 << 21;
pub const TM_CMD_INDEX_CHECK: u32 = 1 << 20;
pub const TM_CMD_CRC_CHECK: u32 = 1 << 19;
pub const TM_RSPNS_NONE: u32 = 0;
pub const TM_RSPNS_136: u32 = 1 << 16;
pub const TM_RSPNS_48: u32 = 2 << 16;
pub const TM_RSPNS_48_BUSY: u32 = 3 << 16;
pub const TM_RSPNS_MASK: u32 = 3 << 16;
pub const TM_MULTI_BLOCK: u32 = 1 << 5;
pub const TM_DAT_CARD_TO_HOST: u32 = 1 << 4;
pub const TM_BLKCNT_EN: u32 = 1 << 1;
pub const TM_DMA_EN: u32 = 1 << 0;

pub const RESP_NONE: u32 = TM_RSPNS_NONE;
pub const RESP_R1: u32 = TM_RSPNS_48 | TM_CMD_CRC_CHECK;
pub const RESP_R1B: u32 = TM_RSPNS_48_BUSY | TM_CMD_CRC_CHECK;
pub const RESP_R2: u32 = TM_RSPNS_136 | TM_CMD_CRC_CHECK;
pub const RESP_R3: u32 = TM_RSPNS_48;
pub const RESP_R4: u32 = TM_RSPNS_136;
pub const RESP_R6: u32 = TM_RSPNS_48 | TM_CMD_CRC_CHECK;
pub const RESP_R7: u32 = TM_RSPNS_48 | TM_CMD_CRC_CHECK;

pub const DATA_READ: u32 = TM_CMD_ISDATA | TM_DAT_CARD_TO_HOST;
pub const DATA_WRITE: u32 = TM_CMD_ISDATA;

/// Sentinel for command slots the card protocol reserves.
pub const CMD_RESERVED: u32 = 0xffff_ffff;

/// Command indices used by the driver.
pub const GO_IDLE_STATE: u32 = 0;
pub const ALL_SEND_CID: u32 = 2;
pub const SEND_RELATIVE_ADDR: u32 = 3;
pub const IO_SET_OP_COND: u32 = 5;
pub const SELECT_CARD: u32 = 7;
pub const SEND_IF_COND: u32 = 8;
pub const SEND_CSD: u32 = 9;
pub const STOP_TRANSMISSION: u32 = 12;
pub const SEND_STATUS: u32 = 13;
pub const SET_BLOCKLEN: u32 = 16;
pub const READ_SINGLE_BLOCK: u32 = 17;
pub const READ_MULTIPLE_BLOCK: u32 = 18;
pub const WRITE_BLOCK: u32 = 24;
pub const WRITE_MULTIPLE_BLOCK: u32 = 25;
pub const APP_CMD: u32 = 55;

/// Marks an application command (CMD55 prefix required).
pub const IS_APP_CMD: u32 = 0x8000_0000;

pub const fn acmd(index: u32) -> u32 {
	index | IS_APP_CMD
}

pub const SD_SEND_OP_COND: u32 = acmd(41);
pub const SEND_SCR: u32 = acmd(51);

const fn cmd(index: u32) -> u32 {
	index << 24
}

/// CMDTM images for the ordinary command set, indexed by command number.
pub const COMMANDS: [u32; 64] = {
	let mut table = [CMD_RESERVED; 64];
	table[0] = cmd(0);
	table[2] = cmd(2) | RESP_R2;
	table[3] = cmd(3) | RESP_R6;
	table[4] = cmd(4);
	table[5] = cmd(5) | RESP_R4;
	table[6] = cmd(6) | RESP_R1;
	table[7] = cmd(7) | RESP_R1B;
	table[8] = cmd(8) | RESP_R7;
	table[9] = cmd(9) | RESP_R2;
	table[10] = cmd(10) | RESP_R2;
	table[11] = cmd(11) | RESP_R1;
	table[12] = cmd(12) | RESP_R1B | TM_CMD_TYPE_ABORT;
	table[13] = cmd(13) | RESP_R1;
	table[15] = cmd(15);
	table[16] = cmd(16) | RESP_R1;
	table[17] = cmd(17) | RESP_R1 | DATA_READ;
	table[18] = cmd(18) | RESP_R1 | DATA_READ | TM_MULTI_BLOCK | TM_BLKCNT_EN;
	table[19] = cmd(19) | RESP_R1 | DATA_READ;
	table[20] = cmd(20) | RESP_R1B;
	table[23] = cmd(23) | RESP_R1;
	table[24] = cmd(24) | RESP_R1 | DATA_WRITE;
	table[25] = cmd(25) | RESP_R1 | DATA_WRITE | TM_MULTI_BLOCK | TM_BLKCNT_EN;
	table[27] = cmd(27) | RESP_R1 | DATA_WRITE;
	table[28] = cmd(28) | RESP_R1B;
	table[29] = cmd(29) | RESP_R1B;
	table[30] = cmd(30) | RESP_R1 | DATA_READ;
	table[32] = cmd(32) | RESP_R1;
	table[33] = cmd(33) | RESP_R1;
	table[38] = cmd(38) | RESP_R1B;
	table[55] = cmd(55) | RESP_R1;
	table[56] = cmd(56) | RESP_R1 | TM_CMD_ISDATA;
	table
};

/// CMDTM images for the application command set.
pub const APP_COMMANDS: [u32; 64] = {
	let mut table = [CMD_RESERVED; 64];
	table[6] = cmd(6) | RESP_R1;
	table[13] = cmd(13) | RESP_R1;
	table[22] = cmd(22) | RESP_R1 | DATA_READ;
	table[23] = cmd(23) | RESP_R1;
	table[41] = cmd(41) | RESP_R3;
	table[42] = cmd(42) | RESP_R1;
	table[51] = cmd(51) | RESP_R1 | DATA_READ;
	table
};

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_tables_are_consistent() {
		assert_eq!(COMMANDS[17] >> 24, 17);
		assert!(COMMANDS[18] & TM_MULTI_BLOCK != 0);
		assert!(COMMANDS[24] & TM_CMD_ISDATA != 0);
		assert_eq!(COMMANDS[24] & TM_DAT_CARD_TO_HOST, 0);
		assert_eq!(COMMANDS[12] & TM_CMD_TYPE_MASK, TM_CMD_TYPE_ABORT);
		assert_eq!(COMMANDS[1], CMD_RESERVED);
		assert_eq!(APP_COMMANDS[41] & TM_RSPNS_MASK, TM_RSPNS_48);
		assert_eq!(APP_COMMANDS[0], CMD_RESERVED);
	}
}
