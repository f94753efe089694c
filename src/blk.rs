//! The SD-card block driver.
//!
//! Mounts the whole device and every primary partition found in the MBR as
//! separate message ports; the event token of each port identifies its
//! [`BdevUnit`]. Requests are served inline on the event loop through the
//! host controller, with a single 4 KiB cache buffer holding the most
//! recently read disk span. Writes go back one 512-byte sector at a time;
//! the controller has misbehaved on multi-sector PIO writes, so per-sector
//! granularity stays.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::config::DriverConfig;
use crate::drivers::sd::{SdHost, SD_BLOCK_SIZE};
use crate::drivers::DriverError;
use crate::errno;
use crate::event::{Dispatch, EventLoop};
use crate::executor::Executor;
use crate::sys::dma::DmaBuffer;
use crate::sys::{
	CmdCode, Kernel, MsgHeader, MsgId, NodeStat, PortId, MSG_HEADER_SIZE, NMSG_BACKLOG, S_IFBLK,
};

/// Cache/staging buffer size; reads are performed in aligned spans of this
/// size.
pub const BUF_SIZE: usize = 4096;
const BLOCKS_PER_BUF: u64 = (BUF_SIZE / SD_BLOCK_SIZE) as u64;

/// Longest accepted `sendmsg` command line.
const SENDMSG_MAX: usize = 256;

/// One mount point: the whole device or a single partition.
#[derive(Debug, Clone)]
pub struct BdevUnit {
	pub path: String,
	pub port: PortId,
	pub start_lba: u64,
	pub size_bytes: u64,
	pub blocks: u64,
	pub stat: NodeStat,
}

struct BlockCache {
	buf: DmaBuffer,
	valid: bool,
	start_block: u64,
}

#[derive(Debug, Default, Clone)]
struct Profiling {
	enabled: bool,
	reads: u64,
	read_usecs: u64,
	writes: u64,
	write_usecs: u64,
}

pub struct BlkDriver {
	kernel: Rc<dyn Kernel>,
	executor: Rc<Executor>,
	host: RefCell<SdHost>,
	cache: RefCell<BlockCache>,
	units: Vec<BdevUnit>,
	profiling: RefCell<Profiling>,
}

impl BlkDriver {
	/// Brings up the host controller, discovers partitions and publishes
	/// the mounts.
	pub fn new(
		kernel: Rc<dyn Kernel>,
		executor: Rc<Executor>,
		mut host: SdHost,
		config: &DriverConfig,
	) -> Result<BlkDriver, DriverError> {
		host.init().map_err(|err| {
			error!("blk: host controller initialisation failed: {err}");
			err
		})?;

		let capacity_blocks = host.capacity_blocks();
		let entries = host.read_partition_table()?;

		let mut units = Vec::new();
		let whole = Self::publish_unit(
			&kernel,
			config,
			config.pathname.clone(),
			0,
			0,
			capacity_blocks,
			units.len(),
		)?;
		units.push(whole);

		for entry in entries.iter().filter(|entry| entry.is_used()) {
			let path = format!("{}{}", config.pathname, units.len());
			let unit = Self::publish_unit(
				&kernel,
				config,
				path,
				units.len() as i32,
				u64::from(entry.start_lba()),
				u64::from(entry.size_sectors()),
				units.len(),
			)?;
			info!(
				"blk: partition {} type {:#04x} at {} + {} sectors",
				unit.path,
				entry.partition_type,
				entry.start_lba(),
				entry.size_sectors()
			);
			units.push(unit);
		}

		let cache = BlockCache {
			buf: DmaBuffer::new(kernel.clone(), BUF_SIZE)?,
			valid: false,
			start_block: 0,
		};

		Ok(BlkDriver {
			kernel,
			executor,
			host: RefCell::new(host),
			cache: RefCell::new(cache),
			units,
			profiling: RefCell::new(Profiling::default()),
		})
	}

	fn publish_unit(
		kernel: &Rc<dyn Kernel>,
		config: &DriverConfig,
		path: String,
		dev_offset: i32,
		start_lba: u64,
		blocks: u64,
		token: usize,
	) -> Result<BdevUnit, DriverError> {
		let size_bytes = blocks * SD_BLOCK_SIZE as u64;
		let stat = NodeStat {
			dev: config.dev + dev_offset,
			ino: 0,
			mode: S_IFBLK | (config.mode & 0o777),
			uid: config.uid,
			gid: config.gid,
			size: size_bytes,
			blksize: SD_BLOCK_SIZE as u32,
			blocks,
		};
		let port = kernel.create_msgport(&path, &stat, NMSG_BACKLOG)?;
		kernel.watch_port(port, token)?;
		info!("blk: mounted {path}");
		Ok(BdevUnit {
			path,
			port,
			start_lba,
			size_bytes,
			blocks,
			stat,
		})
	}

	/// Services requests until shutdown. The wait is unbounded; the block
	/// driver has no poll interval.
	pub fn run(&self) -> Result<(), DriverError> {
		let events = EventLoop::new(self.kernel.clone(), self.executor.clone(), None);
		events.run(self)
	}

	pub fn units(&self) -> &[BdevUnit] {
		&self.units
	}

	pub fn host(&self) -> Ref<'_, SdHost> {
		self.host.borrow()
	}

	fn reply(&self, unit: &BdevUnit, msgid: MsgId, status: isize) -> Result<(), DriverError> {
		self.kernel.reply_msg(unit.port, msgid, status, &[])?;
		Ok(())
	}

	/// `read` handler: serve from the aligned 4 KiB cache span, refilling
	/// it from the card as the request walks the device.
	fn cmd_read(
		&self,
		unit: &BdevUnit,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError> {
		let started = self.profiling.borrow().enabled.then(|| self.kernel.monotonic_micros());

		let mut offset = header.offset;
		if offset >= unit.size_bytes {
			return self.reply(unit, msgid, 0);
		}
		let mut remaining =
			(u64::from(header.size)).min(unit.size_bytes - offset) as usize;
		let mut xfered = 0usize;

		while remaining > 0 {
			let span_block =
				unit.start_lba + (offset / BUF_SIZE as u64) * BLOCKS_PER_BUF;
			let chunk_start = (offset % BUF_SIZE as u64) as usize;
			let chunk = (BUF_SIZE - chunk_start).min(remaining);

			let mut cache = self.cache.borrow_mut();
			if !cache.valid || cache.start_block != span_block {
				cache.valid = false;
				if let Err(err) = self
					.host
					.borrow_mut()
					.read(cache.buf.as_mut_slice(), span_block as u32)
				{
					error!("blk: read of block {span_block} failed: {err}");
					return self.reply(unit, msgid, -(err.errno() as isize));
				}
				cache.start_block = span_block;
				cache.valid = true;
			}

			let data = &cache.buf.as_slice()[chunk_start..chunk_start + chunk];
			if let Err(err) = self.kernel.write_msg(unit.port, msgid, data, xfered) {
				error!("blk: reply data transfer failed: {err}");
				return self.reply(unit, msgid, -(i32::from(err) as isize));
			}

			xfered += chunk;
			offset += chunk as u64;
			remaining -= chunk;
		}

		if let Some(started) = started {
			let mut profiling = self.profiling.borrow_mut();
			profiling.reads += 1;
			profiling.read_usecs += self.kernel.monotonic_micros() - started;
		}
		self.reply(unit, msgid, xfered as isize)
	}

	/// `write` handler: stage misaligned edges with a pre-read, overlay the
	/// payload, and write back sector by sector.
	fn cmd_write(
		&self,
		unit: &BdevUnit,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError> {
		let started = self.profiling.borrow().enabled.then(|| self.kernel.monotonic_micros());

		let mut offset = header.offset;
		if offset >= unit.size_bytes {
			return self.reply(unit, msgid, -(errno::ENOSPC as isize));
		}
		let mut remaining =
			(u64::from(header.size)).min(unit.size_bytes - offset) as usize;
		let mut xfered = 0usize;

		// The staging buffer is about to hold write data.
		self.cache.borrow_mut().valid = false;

		while remaining > 0 {
			let block_no = unit.start_lba + offset / SD_BLOCK_SIZE as u64;
			let chunk_start = (offset % SD_BLOCK_SIZE as u64) as usize;
			let chunk = (BUF_SIZE - chunk_start).min(remaining);
			let write_size = (chunk_start + chunk).next_multiple_of(SD_BLOCK_SIZE);
			let sectors = write_size / SD_BLOCK_SIZE;

			let mut cache = self.cache.borrow_mut();
			let staging = cache.buf.as_mut_slice();

			if chunk_start != 0 || chunk % SD_BLOCK_SIZE != 0 {
				for sector in 0..sectors {
					let span = &mut staging
						[sector * SD_BLOCK_SIZE..(sector + 1) * SD_BLOCK_SIZE];
					if let Err(err) = self
						.host
						.borrow_mut()
						.read(span, (block_no + sector as u64) as u32)
					{
						error!("blk: pre-read of block {block_no} failed: {err}");
						return self.reply(unit, msgid, -(err.errno() as isize));
					}
				}
			}

			if let Err(err) = self.kernel.read_msg(
				unit.port,
				msgid,
				&mut staging[chunk_start..chunk_start + chunk],
				MSG_HEADER_SIZE + xfered,
			) {
				error!("blk: write data transfer failed: {err}");
				return self.reply(unit, msgid, -(i32::from(err) as isize));
			}

			for sector in 0..sectors {
				let span =
					&staging[sector * SD_BLOCK_SIZE..(sector + 1) * SD_BLOCK_SIZE];
				if let Err(err) = self
					.host
					.borrow_mut()
					.write(span, (block_no + sector as u64) as u32)
				{
					error!("blk: write of block {block_no} failed: {err}");
					return self.reply(unit, msgid, -(err.errno() as isize));
				}
			}

			xfered += chunk;
			offset += chunk as u64;
			remaining -= chunk;
		}

		if let Some(started) = started {
			let mut profiling = self.profiling.borrow_mut();
			profiling.writes += 1;
			profiling.write_usecs += self.kernel.monotonic_micros() - started;
		}
		self.reply(unit, msgid, xfered as isize)
	}

	/// `sendmsg` handler: the driver's text console (`help`, `profiling`,
	/// `debug`).
	fn cmd_sendmsg(
		&self,
		unit: &BdevUnit,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError> {
		let request_len = header.ssize as usize;
		if request_len > SENDMSG_MAX {
			return self.reply(unit, msgid, -(errno::E2BIG as isize));
		}

		let mut request = vec![0u8; request_len];
		if self
			.kernel
			.read_msg(unit.port, msgid, &mut request, MSG_HEADER_SIZE)
			.is_err()
		{
			return self.reply(unit, msgid, -(errno::EFAULT as isize));
		}

		let text = String::from_utf8_lossy(&request);
		let mut words = text.split_whitespace();
		let response = match words.next() {
			None => "ERROR: no command\n".to_string(),
			Some("help") => concat!(
				"OK: help\n",
				"help              - get command list\n",
				"profiling stats   - get statistics\n",
				"profiling enable  - enable profiling\n",
				"profiling disable - disable profiling\n",
				"profiling reset   - reset statistics\n",
				"debug registers   - dump registers\n",
			)
			.to_string(),
			Some("profiling") => self.profiling_command(words.next()),
			Some("debug") => match words.next() {
				Some("registers") => {
					format!("OK: registers\n{}", self.host.borrow().dump_registers())
				}
				_ => "ERROR: unknown debug subcommand\n".to_string(),
			},
			Some(_) => "ERROR: unknown command\n".to_string(),
		};

		let limit = (header.rsize as usize).min(response.len());
		let data = &response.as_bytes()[..limit];
		if let Err(err) = self.kernel.write_msg(unit.port, msgid, data, 0) {
			return self.reply(unit, msgid, -(i32::from(err) as isize));
		}
		self.reply(unit, msgid, data.len() as isize)
	}

	fn profiling_command(&self, subcommand: Option<&str>) -> String {
		let mut profiling = self.profiling.borrow_mut();
		match subcommand {
			Some("stats") => format!(
				"OK: profiling stats\nreads:  {} ({} us)\nwrites: {} ({} us)\n",
				profiling.reads, profiling.read_usecs, profiling.writes, profiling.write_usecs,
			),
			Some("enable") => {
				profiling.enabled = true;
				"OK: profiling enabled\n".to_string()
			}
			Some("disable") => {
				profiling.enabled = false;
				"OK: profiling disabled\n".to_string()
			}
			Some("reset") => {
				*profiling = Profiling {
					enabled: profiling.enabled,
					..Profiling::default()
				};
				"OK: profiling reset\n".to_string()
			}
			_ => "ERROR: unknown profiling subcommand\n".to_string(),
		}
	}
}

impl Dispatch for BlkDriver {
	fn handle_message(
		&self,
		token: usize,
		port: PortId,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError> {
		let Some(unit) = self.units.get(token).filter(|unit| unit.port == port) else {
			return Err(DriverError::Fatal(format!(
				"message on unknown unit token {token}"
			)));
		};

		match CmdCode::try_from(header.cmd) {
			Ok(CmdCode::Read) => self.cmd_read(unit, msgid, header),
			Ok(CmdCode::Write) => self.cmd_write(unit, msgid, header),
			Ok(CmdCode::Sendmsg) => self.cmd_sendmsg(unit, msgid, header),
			_ => {
				warn!("blk: unknown command {}", header.cmd);
				self.reply(unit, msgid, -(errno::ENOTSUP as isize))
			}
		}
	}

	fn handle_interrupt(&self, _bits: u32) {
		// The host controller is polled; card events reach the driver
		// through the INTERRUPT register, not a thread event.
	}

	fn unmask_interrupt(&self) {}
}
