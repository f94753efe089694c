//! SD card host controller driver (EMMC).
//!
//! Implements the HCSS 3.00 host state machine over the BCM2711 `emmc2`
//! block: controller bring-up, card identification, clocking, CMD/ACMD
//! issuance with per-command microsecond timeouts, PIO and SDMA block
//! transfer, retries, and re-initialisation after card removal or
//! unexpected card state.

mod host;
pub mod mbr;
pub mod regs;

use thiserror::Error;

pub use self::host::{SdHost, SD_BLOCK_SIZE, SD_CLOCK_ID, SD_CLOCK_NORMAL};
use crate::errno;
use crate::sys::SysError;

#[derive(Debug, Clone, Copy)]
pub struct SdConfig {
	/// Power-cycle the card through the mailbox before bring-up.
	pub power_cycle: bool,
	/// Use SDMA for aligned transfers; retries fall back to PIO.
	pub enable_sdma: bool,
}

impl Default for SdConfig {
	fn default() -> Self {
		Self {
			power_cycle: true,
			enable_sdma: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SdVersion {
	Unknown,
	V1,
	V1_1,
	V2,
	V3,
	V4,
}

impl std::fmt::Display for SdVersion {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			SdVersion::Unknown => "unknown",
			SdVersion::V1 => "1.0 and 1.01",
			SdVersion::V1_1 => "1.10",
			SdVersion::V2 => "2.00",
			SdVersion::V3 => "3.0x",
			SdVersion::V4 => "4.xx",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SdError {
	#[error("host controller version {0} not supported")]
	UnsupportedVersion(u32),
	#[error("controller did not come out of reset")]
	ResetTimeout,
	#[error("internal clock did not stabilise")]
	ClockTimeout,
	#[error("no card inserted")]
	NoCard,
	#[error("SDIO cards are not supported")]
	SdioCard,
	#[error("unusable card (CMD8 response {0:#010x})")]
	UnusableCard(u32),
	#[error("card removed")]
	CardRemoved,
	#[error("invalid command {0:#x}")]
	InvalidCommand(u32),
	#[error("CMD{cmd} timed out")]
	Timeout { cmd: u32 },
	#[error("CMD{cmd} failed, interrupt {interrupt:#010x}")]
	Command { cmd: u32, interrupt: u32 },
	#[error("card in unusable state {0}")]
	BadCardState(u32),
	#[error("buffer length {0} is not a positive multiple of the block size")]
	BadBufferSize(usize),
	#[error("{0} blocks exceed the controller transfer limit")]
	TooManyBlocks(usize),
	#[error("command aborted")]
	Interrupted,
	#[error("card identification failed: {0}")]
	Identification(&'static str),
	#[error(transparent)]
	Sys(#[from] SysError),
}

impl SdError {
	/// The errno this failure surfaces as on a client reply.
	pub fn errno(&self) -> i32 {
		match self {
			SdError::NoCard | SdError::CardRemoved => errno::ENODEV,
			SdError::Interrupted => errno::EINTR,
			SdError::BadBufferSize(_) | SdError::TooManyBlocks(_) => errno::EINVAL,
			SdError::Sys(err) => i32::from(*err),
			_ => errno::EIO,
		}
	}
}
