//! The consumed kernel surface.
//!
//! Drivers reach the Osprey kernel exclusively through the [`Kernel`] trait:
//! message ports, the event queue, interrupt servers, physical memory,
//! signal delivery, the monotonic clock and the mailbox power/clock tags.
//! Production processes hand the drivers the real syscall binding from the
//! Osprey runtime; the test suite substitutes [`mock::MockKernel`].

pub mod dma;
pub mod mmio;
pub mod mock;

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errno;

pub type PortId = i32;
pub type MsgId = i32;

/// Request backlog of a message port: one read, one write, one control
/// command may be in flight per device.
pub const NMSG_BACKLOG: usize = 3;

pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGTERM: i32 = 15;

/// `st_mode` type bits of a published mount node.
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;

/// Mailbox property-tag device and clock ids consumed by the SD driver.
pub const MBOX_DEVICE_ID_SDCARD: u32 = 0x0;
pub const MBOX_CLOCK_ID_EMMC2: u32 = 0xc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel call failed (errno {errno})")]
pub struct SysError {
	pub errno: i32,
}

impl SysError {
	pub const fn new(errno: i32) -> Self {
		Self { errno }
	}
}

pub type SysResult<T> = Result<T, SysError>;

/// Command codes carried in the first word of every client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum CmdCode {
	Read = 1,
	Write = 2,
	Isatty = 3,
	Tcgetattr = 4,
	Tcsetattr = 5,
	Abort = 6,
	Sendmsg = 7,
}

/// Fixed-size request header, the first bytes of every port message.
///
/// Payloads (write data, termios images, `sendmsg` text) follow the header
/// in the client's message buffer and are fetched with [`Kernel::read_msg`]
/// at offsets relative to the start of that buffer, so payload offsets begin
/// at [`MSG_HEADER_SIZE`]. Reply data written with [`Kernel::write_msg`]
/// lands in the client's receive buffer, whose offsets start at zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MsgHeader {
	pub cmd: u32,
	/// `abort`: message id to cancel.
	pub target: i32,
	/// `read`/`write`: byte offset into the device.
	pub offset: u64,
	/// `read`/`write`: requested transfer size.
	pub size: u32,
	/// `sendmsg`: subclass tag.
	pub subclass: u32,
	/// `sendmsg`: size of the text following the header.
	pub ssize: u32,
	/// `sendmsg`: capacity of the client's reply buffer.
	pub rsize: u32,
}

pub const MSG_HEADER_SIZE: usize = std::mem::size_of::<MsgHeader>();

impl MsgHeader {
	pub fn read(offset: u64, size: u32) -> Self {
		Self {
			cmd: CmdCode::Read.into(),
			target: 0,
			offset,
			size,
			subclass: 0,
			ssize: 0,
			rsize: 0,
		}
	}

	pub fn write(offset: u64, size: u32) -> Self {
		Self {
			cmd: CmdCode::Write.into(),
			..Self::read(offset, size)
		}
	}

	pub fn control(cmd: CmdCode) -> Self {
		Self {
			cmd: cmd.into(),
			..Self::read(0, 0)
		}
	}

	pub fn abort(target: MsgId) -> Self {
		Self {
			cmd: CmdCode::Abort.into(),
			target,
			..Self::read(0, 0)
		}
	}

	pub fn sendmsg(subclass: u32, ssize: u32, rsize: u32) -> Self {
		Self {
			cmd: CmdCode::Sendmsg.into(),
			target: 0,
			offset: 0,
			size: 0,
			subclass,
			ssize,
			rsize,
		}
	}
}

/// `stat` snapshot attached to a mount node, visible to clients via `fstat`.
#[derive(Debug, Clone, Default)]
pub struct NodeStat {
	pub dev: i32,
	pub ino: u32,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub blksize: u32,
	pub blocks: u64,
}

/// One entry drained from the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	/// A watched message port has requests queued. `token` is the user data
	/// registered with [`Kernel::watch_port`], identifying the unit.
	Port { port: PortId, token: usize },
	/// Bitmask of thread events raised by registered interrupt servers.
	Thread { bits: u32 },
}

/// Hardware description of one device-tree node, as resolved by the
/// platform's FDT helpers (the blob parser itself lives outside the crate).
#[derive(Debug, Clone)]
pub struct DeviceNode {
	pub path: String,
	pub compatible: String,
	pub reg_base: u64,
	pub reg_size: usize,
	pub irq: u32,
}

/// The syscall surface of the Osprey kernel, as consumed by drivers.
pub trait Kernel {
	/// Publishes a message port at `path` carrying `stat`.
	fn create_msgport(&self, path: &str, stat: &NodeStat, backlog: usize) -> SysResult<PortId>;

	/// Drains the next request from a port. Returns the message id and the
	/// header length, or `None` when the port is empty.
	fn get_msg(&self, port: PortId, buf: &mut [u8]) -> SysResult<Option<(MsgId, usize)>>;

	/// Completes a request with `status` and optional inline reply data.
	fn reply_msg(&self, port: PortId, msgid: MsgId, status: isize, data: &[u8]) -> SysResult<()>;

	/// Copies from the client's message buffer, starting at `offset`.
	fn read_msg(
		&self,
		port: PortId,
		msgid: MsgId,
		buf: &mut [u8],
		offset: usize,
	) -> SysResult<usize>;

	/// Copies into the client's receive buffer, starting at `offset`.
	fn write_msg(&self, port: PortId, msgid: MsgId, data: &[u8], offset: usize)
		-> SysResult<usize>;

	/// Registers a port on the event queue; `token` comes back in
	/// [`Event::Port`].
	fn watch_port(&self, port: PortId, token: usize) -> SysResult<()>;

	/// Blocks until events are pending or `timeout` expires (`None` blocks
	/// indefinitely). An empty batch means the timeout elapsed.
	fn wait_events(&self, timeout: Option<Duration>) -> SysResult<SmallVec<[Event; 4]>>;

	/// Subscribes the process to `irq`; deliveries set `1 << event_bit` in
	/// [`Event::Thread`] and leave the line masked until
	/// [`Kernel::unmask_interrupt`].
	fn add_interrupt_server(&self, irq: u32, event_bit: u32) -> SysResult<()>;

	fn unmask_interrupt(&self, irq: u32) -> SysResult<()>;

	/// Posts `signo` to the processes holding the node open.
	fn signal_notify(&self, port: PortId, ino: u32, signo: i32) -> SysResult<()>;

	/// Maps a physical register window uncached into the process.
	fn map_phys_mem(&self, paddr: u64, len: usize) -> SysResult<*mut u32>;

	/// Translates a virtual address for DMA programming.
	fn virtual_to_phys(&self, vaddr: *const u8) -> SysResult<u64>;

	/// Cleans the data cache over a buffer about to be read by a device.
	fn dcache_flush(&self, vaddr: *const u8, len: usize);

	/// Invalidates the data cache over a buffer a device has written.
	fn dcache_invalidate(&self, vaddr: *const u8, len: usize);

	/// Microseconds of monotonic clock.
	fn monotonic_micros(&self) -> u64;

	/// Sleeps the calling task; forwarded to `nanosleep`.
	fn delay_micros(&self, usec: u64);

	/// Mailbox `SET_POWER_STATE` tag. Returns the resulting power state.
	fn set_power_state(&self, device_id: u32, on: bool) -> SysResult<bool>;

	/// Mailbox `GET_CLOCK_RATE` tag, in Hz.
	fn clock_rate(&self, clock_id: u32) -> SysResult<u32>;

	/// Hardware description of the device-tree node at `path`.
	fn device_node(&self, path: &str) -> SysResult<DeviceNode>;

	/// Set by the SIGTERM handler; observed by the event loop.
	fn shutdown_requested(&self) -> bool;
}

/// Monotonic-clock deadline for the bounded MMIO polling loops of the host
/// controller driver. Polling is not a suspension point, so every spin is
/// bracketed by one of these.
pub struct Deadline {
	expires_at: u64,
}

impl Deadline {
	pub fn after(kernel: &dyn Kernel, usec: u64) -> Self {
		Self {
			expires_at: kernel.monotonic_micros().saturating_add(usec),
		}
	}

	pub fn expired(&self, kernel: &dyn Kernel) -> bool {
		kernel.monotonic_micros() >= self.expires_at
	}
}

/// Maps a [`SysError`] onto the errno to reply with.
impl From<SysError> for i32 {
	fn from(err: SysError) -> i32 {
		if err.errno > 0 {
			err.errno
		} else {
			errno::EIO
		}
	}
}
