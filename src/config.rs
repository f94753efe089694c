//! Driver configuration from command-line arguments.
//!
//! Every driver takes the same mount-node attributes (`-u <uid>`, `-g <gid>`,
//! `-m <octal-mode>`, `-d <dev>`) and one positional argument, the absolute
//! path at which the message port is published. TTY drivers additionally take
//! `-b <baud>`, `-s {0|1|2}` (stop bits), `-p` (parity) and `-f {hard|none}`
//! (flow control). The configuration is immutable after startup.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("missing mount pathname")]
	MissingPath,
	#[error("option -{0} requires an argument")]
	MissingArgument(char),
	#[error("invalid value for -{option}: {value}")]
	InvalidValue { option: char, value: String },
	#[error("unknown option: {0}")]
	UnknownOption(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
	None,
	Hardware,
}

/// Mount-node attributes common to all drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
	pub pathname: String,
	pub uid: u32,
	pub gid: u32,
	pub mode: u32,
	pub dev: i32,
}

/// Line parameters of a TTY driver.
#[derive(Debug, Clone)]
pub struct TtyParams {
	pub baud: u32,
	pub stop_bits: u8,
	pub parity: bool,
	pub flow_control: FlowControl,
}

impl Default for TtyParams {
	fn default() -> Self {
		Self {
			baud: 115_200,
			stop_bits: 1,
			parity: false,
			flow_control: FlowControl::None,
		}
	}
}

impl DriverConfig {
	/// Parses the common option set. `args` excludes the program name.
	pub fn parse(args: &[String]) -> Result<DriverConfig, ConfigError> {
		let (config, _) = parse_options(args, false)?;
		Ok(config)
	}

	/// Parses the common options plus the TTY line parameters.
	pub fn parse_tty(args: &[String]) -> Result<(DriverConfig, TtyParams), ConfigError> {
		let (config, params) = parse_options(args, true)?;
		Ok((config, params))
	}
}

fn parse_options(
	args: &[String],
	tty: bool,
) -> Result<(DriverConfig, TtyParams), ConfigError> {
	let mut config = DriverConfig {
		pathname: String::new(),
		uid: 0,
		gid: 0,
		mode: 0o600,
		dev: -1,
	};
	let mut params = TtyParams::default();
	let mut path = None;

	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		let opt = match arg.strip_prefix('-') {
			Some(opt) if !arg.is_empty() && arg != "-" => opt,
			_ => {
				path = Some(arg.clone());
				continue;
			}
		};

		let mut take = |option: char| {
			iter.next()
				.map(String::as_str)
				.ok_or(ConfigError::MissingArgument(option))
		};

		match opt {
			"u" => config.uid = parse_number(take('u')?, 'u')?,
			"g" => config.gid = parse_number(take('g')?, 'g')?,
			"m" => config.mode = parse_octal(take('m')?, 'm')?,
			"d" => config.dev = parse_number(take('d')?, 'd')?,
			"b" if tty => params.baud = parse_number(take('b')?, 'b')?,
			"s" if tty => {
				let value = take('s')?;
				params.stop_bits = parse_number(value, 's')?;
				if params.stop_bits > 2 {
					return Err(ConfigError::InvalidValue {
						option: 's',
						value: value.to_string(),
					});
				}
			}
			"p" if tty => params.parity = true,
			"f" if tty => {
				params.flow_control = match take('f')? {
					"hard" => FlowControl::Hardware,
					"none" => FlowControl::None,
					other => {
						return Err(ConfigError::InvalidValue {
							option: 'f',
							value: other.to_string(),
						});
					}
				}
			}
			_ => return Err(ConfigError::UnknownOption(arg.clone())),
		}
	}

	config.pathname = path.ok_or(ConfigError::MissingPath)?;
	Ok((config, params))
}

fn parse_number<T>(value: &str, option: char) -> Result<T, ConfigError>
where
	T: std::str::FromStr,
{
	value.parse().map_err(|_| ConfigError::InvalidValue {
		option,
		value: value.to_string(),
	})
}

fn parse_octal(value: &str, option: char) -> Result<u32, ConfigError> {
	let digits = value.strip_prefix("0o").unwrap_or(value);
	u32::from_str_radix(digits, 8).map_err(|_| ConfigError::InvalidValue {
		option,
		value: value.to_string(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(list: &[&str]) -> Vec<String> {
		list.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn parses_block_driver_options() {
		let config =
			DriverConfig::parse(&args(&["-u", "1", "-g", "2", "-m", "644", "-d", "5", "/dev/sd"]))
				.unwrap();
		assert_eq!(config.uid, 1);
		assert_eq!(config.gid, 2);
		assert_eq!(config.mode, 0o644);
		assert_eq!(config.dev, 5);
		assert_eq!(config.pathname, "/dev/sd");
	}

	#[test]
	fn parses_tty_options() {
		let (config, params) = DriverConfig::parse_tty(&args(&[
			"-b", "9600", "-s", "2", "-p", "-f", "hard", "/dev/tty0",
		]))
		.unwrap();
		assert_eq!(config.pathname, "/dev/tty0");
		assert_eq!(params.baud, 9600);
		assert_eq!(params.stop_bits, 2);
		assert!(params.parity);
		assert_eq!(params.flow_control, FlowControl::Hardware);
	}

	#[test]
	fn rejects_missing_path() {
		assert_eq!(
			DriverConfig::parse(&args(&["-u", "0"])),
			Err(ConfigError::MissingPath)
		);
	}

	#[test]
	fn rejects_bad_stop_bits() {
		let err = DriverConfig::parse_tty(&args(&["-s", "3", "/dev/tty0"])).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { option: 's', .. }));
	}

	#[test]
	fn rejects_tty_options_for_block_drivers() {
		let err = DriverConfig::parse(&args(&["-b", "9600", "/dev/sd"])).unwrap_err();
		assert!(matches!(err, ConfigError::UnknownOption(_)));
	}
}
