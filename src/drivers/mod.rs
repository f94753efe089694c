//! Device adapters.
//!
//! Board-specific hardware sits behind capability traits
//! ([`uart::UartHardware`] for character devices, the SD host controller in
//! [`sd`] for the block device) and is selected at init time from
//! device-tree compatible strings. Everything above the adapters is
//! board-independent.

pub mod sd;
pub mod uart;

use thiserror::Error;

use crate::config::ConfigError;
use crate::errno;
use crate::sys::SysError;
use self::sd::SdError;

#[derive(Debug, Error)]
pub enum DriverError {
	#[error("configuration: {0}")]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Sys(#[from] SysError),
	#[error(transparent)]
	Sd(#[from] SdError),
	#[error("unsupported hardware: {0}")]
	UnsupportedHardware(String),
	#[error("driver invariant violated: {0}")]
	Fatal(String),
}

impl DriverError {
	/// The errno to reply with when the failure reaches a client.
	pub fn errno(&self) -> i32 {
		match self {
			DriverError::Config(_) => errno::EINVAL,
			DriverError::Sys(err) => i32::from(*err),
			DriverError::Sd(err) => err.errno(),
			DriverError::UnsupportedHardware(_) => errno::ENODEV,
			DriverError::Fatal(_) => errno::EIO,
		}
	}
}
