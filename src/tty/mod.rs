//! The TTY driver.
//!
//! Serves a character device over a message port. The event loop stashes
//! read and write requests into per-direction pending slots and wakes the
//! corresponding director task; the directors move bytes between the client
//! and the TX/RX rings; the uart sub-secretary tasks move bytes between the
//! rings and the device FIFOs through the board adapter. Received bytes pass
//! through the line [`discipline`] on their way into the RX ring.
//!
//! At most one read, one write and one control request are in flight per
//! device; an `abort` naming a pending request clears its slot, replies
//! `-EINTR` and wakes every rendezvous the affected director might be
//! sleeping on.

pub mod discipline;
pub mod termios;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use zerocopy::{FromBytes, IntoBytes};

use self::termios::{ControlFlags, LocalFlags, OutputFlags, Termios};
use crate::collections::RingBuffer;
use crate::config::{DriverConfig, FlowControl, TtyParams};
use crate::drivers::uart::{UartHardware, WakeFlags};
use crate::drivers::DriverError;
use crate::errno;
use crate::event::{Dispatch, EventLoop};
use crate::executor::{Executor, Rendezvous};
use crate::sys::{
	CmdCode, Kernel, MsgHeader, MsgId, NodeStat, PortId, MSG_HEADER_SIZE, NMSG_BACKLOG, S_IFCHR,
};

/// TX and RX ring capacity.
const RING_CAPACITY: usize = 4096;

/// The event loop polls the device at least this often even without
/// interrupts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
struct PendingIo {
	msgid: MsgId,
	size: usize,
}

pub(crate) struct TtyState {
	pub(crate) rx: RingBuffer,
	pub(crate) tx: RingBuffer,
	pub(crate) termios: Termios,
	pub(crate) line_count: usize,
	read_slot: Option<PendingIo>,
	write_slot: Option<PendingIo>,
}

/// Rendezvous points of the TTY pipeline.
pub(crate) struct TtyRendezvous {
	/// A read request is pending.
	read_cmd: Rendezvous,
	/// A write request is pending.
	write_cmd: Rendezvous,
	/// RX has a complete line (canonical) or any bytes (raw).
	rx_data: Rendezvous,
	/// TX free space increased.
	tx_free: Rendezvous,
	/// RX hardware predicate may have changed.
	rx: Rendezvous,
	/// TX hardware predicate may have changed.
	tx: Rendezvous,
}

pub(crate) struct Tty {
	kernel: Rc<dyn Kernel>,
	executor: Rc<Executor>,
	hw: Rc<dyn UartHardware>,
	port: PortId,
	ino: u32,
	pub(crate) state: RefCell<TtyState>,
	pub(crate) rendez: TtyRendezvous,
}

pub struct TtyDriver {
	tty: Rc<Tty>,
}

impl TtyDriver {
	pub fn new(
		kernel: Rc<dyn Kernel>,
		executor: Rc<Executor>,
		hw: Rc<dyn UartHardware>,
		config: &DriverConfig,
		params: &TtyParams,
	) -> Result<TtyDriver, DriverError> {
		let mut termios = Termios::canonical(params.baud);
		let mut cflags = ControlFlags::CS8;
		if params.stop_bits == 2 {
			cflags |= ControlFlags::CSTOPB;
		}
		if params.parity {
			cflags |= ControlFlags::PARENB;
		}
		if params.flow_control == FlowControl::Hardware {
			cflags |= ControlFlags::CRTSCTS;
		}
		termios.c_cflag = cflags.bits();

		hw.configure(&termios)?;

		let stat = NodeStat {
			dev: config.dev,
			ino: 0,
			mode: S_IFCHR | (config.mode & 0o777),
			uid: config.uid,
			gid: config.gid,
			size: 0,
			blksize: 0,
			blocks: 0,
		};
		let port = kernel.create_msgport(&config.pathname, &stat, NMSG_BACKLOG)?;
		kernel.watch_port(port, 0)?;
		info!("tty: mounted {}", config.pathname);

		let tty = Rc::new(Tty {
			kernel,
			executor: executor.clone(),
			hw,
			port,
			ino: 0,
			state: RefCell::new(TtyState {
				rx: RingBuffer::new(RING_CAPACITY),
				tx: RingBuffer::new(RING_CAPACITY),
				termios,
				line_count: 0,
				read_slot: None,
				write_slot: None,
			}),
			rendez: TtyRendezvous {
				read_cmd: Rendezvous::new(),
				write_cmd: Rendezvous::new(),
				rx_data: Rendezvous::new(),
				tx_free: Rendezvous::new(),
				rx: Rendezvous::new(),
				tx: Rendezvous::new(),
			},
		});

		executor.spawn(reader_task(tty.clone()));
		executor.spawn(writer_task(tty.clone()));
		executor.spawn(uart_tx_task(tty.clone()));
		executor.spawn(uart_rx_task(tty.clone()));

		Ok(TtyDriver { tty })
	}

	/// Services the device until shutdown.
	pub fn run(&self) -> Result<(), DriverError> {
		let events = EventLoop::new(
			self.tty.kernel.clone(),
			self.tty.executor.clone(),
			Some(POLL_INTERVAL),
		);
		events.run(self)
	}

	pub fn port(&self) -> PortId {
		self.tty.port
	}

	// Introspection used by diagnostics and the test suite.

	pub fn rx_snapshot(&self) -> Vec<u8> {
		let state = self.tty.state.borrow();
		let (first, second) = state.rx.read_slices(state.rx.len());
		let mut bytes = first.to_vec();
		bytes.extend_from_slice(second);
		bytes
	}

	pub fn line_count(&self) -> usize {
		self.tty.state.borrow().line_count
	}

	pub fn termios(&self) -> Termios {
		self.tty.state.borrow().termios
	}
}

impl Dispatch for TtyDriver {
	fn handle_message(
		&self,
		_token: usize,
		port: PortId,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError> {
		debug_assert_eq!(port, self.tty.port);
		match CmdCode::try_from(header.cmd) {
			Ok(CmdCode::Read) => self.tty.cmd_read(msgid, header),
			Ok(CmdCode::Write) => self.tty.cmd_write(msgid, header),
			Ok(CmdCode::Isatty) => self.tty.reply(msgid, 1, &[]),
			Ok(CmdCode::Tcgetattr) => self.tty.cmd_tcgetattr(msgid),
			Ok(CmdCode::Tcsetattr) => self.tty.cmd_tcsetattr(msgid),
			Ok(CmdCode::Abort) => self.tty.cmd_abort(msgid, header.target),
			_ => {
				warn!("tty: unknown command {}", header.cmd);
				self.tty.reply(msgid, -(errno::ENOTSUP as isize), &[])
			}
		}
	}

	fn handle_interrupt(&self, bits: u32) {
		let flags = self.tty.hw.handle_interrupt(bits);
		if flags.contains(WakeFlags::RX) {
			self.tty.rendez.rx.wakeup_all();
		}
		if flags.contains(WakeFlags::TX) {
			self.tty.rendez.tx.wakeup_all();
		}
	}

	fn unmask_interrupt(&self) {
		self.tty.hw.unmask_interrupt();
	}

	fn poll_device(&self) {
		// No interrupt within the poll interval; let the uart tasks sample
		// the ready bits themselves.
		self.tty.rendez.rx.wakeup_all();
		self.tty.rendez.tx.wakeup_all();
	}
}

impl Tty {
	fn reply(&self, msgid: MsgId, status: isize, data: &[u8]) -> Result<(), DriverError> {
		self.kernel.reply_msg(self.port, msgid, status, data)?;
		Ok(())
	}

	fn cmd_read(&self, msgid: MsgId, header: &MsgHeader) -> Result<(), DriverError> {
		{
			let mut state = self.state.borrow_mut();
			if state.read_slot.is_some() {
				warn!("tty: read while a read is pending");
				return self.reply(msgid, -(errno::EBUSY as isize), &[]);
			}
			state.read_slot = Some(PendingIo {
				msgid,
				size: header.size as usize,
			});
		}
		self.rendez.read_cmd.wakeup();
		Ok(())
	}

	fn cmd_write(&self, msgid: MsgId, header: &MsgHeader) -> Result<(), DriverError> {
		{
			let mut state = self.state.borrow_mut();
			if state.write_slot.is_some() {
				warn!("tty: write while a write is pending");
				return self.reply(msgid, -(errno::EBUSY as isize), &[]);
			}
			state.write_slot = Some(PendingIo {
				msgid,
				size: header.size as usize,
			});
		}
		self.rendez.write_cmd.wakeup();
		Ok(())
	}

	fn cmd_tcgetattr(&self, msgid: MsgId) -> Result<(), DriverError> {
		let termios = self.state.borrow().termios;
		self.reply(msgid, 0, termios.as_bytes())
	}

	fn cmd_tcsetattr(&self, msgid: MsgId) -> Result<(), DriverError> {
		let mut raw = [0u8; std::mem::size_of::<Termios>()];
		if self
			.kernel
			.read_msg(self.port, msgid, &mut raw, MSG_HEADER_SIZE)
			.is_err()
		{
			return self.reply(msgid, -(errno::EFAULT as isize), &[]);
		}
		let Ok(termios) = Termios::read_from_bytes(&raw) else {
			return self.reply(msgid, -(errno::EINVAL as isize), &[]);
		};
		self.state.borrow_mut().termios = termios;
		self.reply(msgid, 0, &[])
	}

	/// Cancels the pending request `target`. Aborting a message that is
	/// neither the pending read nor the pending write is an invariant
	/// violation and fatal to the driver.
	fn cmd_abort(&self, msgid: MsgId, target: MsgId) -> Result<(), DriverError> {
		let cancelled = {
			let mut state = self.state.borrow_mut();
			if state.read_slot.is_some_and(|slot| slot.msgid == target) {
				state.read_slot = None;
				Some(true)
			} else if state.write_slot.is_some_and(|slot| slot.msgid == target) {
				state.write_slot = None;
				Some(false)
			} else {
				None
			}
		};

		match cancelled {
			Some(true) => {
				self.reply(target, -(errno::EINTR as isize), &[])?;
				self.rendez.read_cmd.wakeup_all();
				self.rendez.rx_data.wakeup_all();
			}
			Some(false) => {
				self.reply(target, -(errno::EINTR as isize), &[])?;
				self.rendez.write_cmd.wakeup_all();
				self.rendez.tx_free.wakeup_all();
			}
			None => {
				return Err(DriverError::Fatal(format!(
					"abort of unknown message {target}"
				)));
			}
		}
		self.reply(msgid, 0, &[])
	}

	fn notify_signal(&self, signo: i32) {
		if let Err(err) = self.kernel.signal_notify(self.port, self.ino, signo) {
			warn!("tty: signal {signo} delivery failed: {err}");
		}
	}

	/// Enqueues a byte on the TX ring with output mapping applied; echo and
	/// client writes share this path.
	pub(crate) async fn tx_put(&self, byte: u8) {
		let onlcr = {
			let state = self.state.borrow();
			state.termios.oflags().contains(OutputFlags::ONLCR)
		};
		if byte == b'\n' && onlcr {
			self.tx_put_raw(b'\r').await;
		}
		self.tx_put_raw(byte).await;
	}

	/// Enqueues a byte on the TX ring, sleeping while it is full.
	pub(crate) async fn tx_put_raw(&self, byte: u8) {
		loop {
			{
				let mut state = self.state.borrow_mut();
				if state.tx.push(byte) {
					break;
				}
			}
			// Full; let the uart side drain before sleeping on free space.
			self.rendez.tx.wakeup_all();
			self.rendez.tx_free.sleep().await;
		}
		self.rendez.tx.wakeup_all();
	}
}

/// Director task for client reads.
async fn reader_task(tty: Rc<Tty>) {
	'requests: loop {
		while tty.state.borrow().read_slot.is_none() {
			tty.rendez.read_cmd.sleep().await;
		}

		// Wait until a whole line (canonical) or any byte (raw) is queued,
		// re-checking the slot after every wakeup in case of an abort.
		let pending = loop {
			let ready = {
				let state = tty.state.borrow();
				let Some(pending) = state.read_slot else {
					continue 'requests;
				};
				let ready = if state.termios.lflags().contains(LocalFlags::ICANON) {
					state.line_count > 0
				} else {
					!state.rx.is_empty()
				};
				ready.then_some(pending)
			};
			match ready {
				Some(pending) => break pending,
				None => tty.rendez.rx_data.sleep().await,
			}
		};

		let copied = {
			let state = tty.state.borrow();
			let canonical = state.termios.lflags().contains(LocalFlags::ICANON);
			let line_len = canonical.then(|| line_length(&state));
			let count = line_len.unwrap_or(state.rx.len()).min(pending.size);

			let (first, second) = state.rx.read_slices(count);
			let copy = tty
				.kernel
				.write_msg(tty.port, pending.msgid, first, 0)
				.and_then(|_| {
					tty.kernel
						.write_msg(tty.port, pending.msgid, second, first.len())
				});
			match copy {
				Ok(_) => Ok((count, line_len)),
				Err(err) => Err(err),
			}
		};

		let status = match copied {
			Ok((count, line_len)) => {
				let mut state = tty.state.borrow_mut();
				state.rx.consume(count);
				// A line is accounted consumed only when this read ran
				// through its terminator; short reads leave it counted.
				if line_len == Some(count) {
					state.line_count -= 1;
				}
				count as isize
			}
			Err(err) => {
				error!("tty: read transfer failed: {err}");
				-(i32::from(err) as isize)
			}
		};

		tty.rendez.rx.wakeup_all();
		if let Err(err) = tty.kernel.reply_msg(tty.port, pending.msgid, status, &[]) {
			error!("tty: read reply failed: {err}");
		}
		tty.state.borrow_mut().read_slot = None;
	}
}

/// Director task for client writes.
async fn writer_task(tty: Rc<Tty>) {
	'requests: loop {
		while tty.state.borrow().write_slot.is_none() {
			tty.rendez.write_cmd.sleep().await;
		}

		// Wait for TX free space, re-checking the slot after every wakeup.
		let pending = loop {
			let ready = {
				let state = tty.state.borrow();
				let Some(pending) = state.write_slot else {
					continue 'requests;
				};
				(state.tx.free_len() > 0).then_some(pending)
			};
			match ready {
				Some(pending) => break pending,
				None => tty.rendez.tx_free.sleep().await,
			}
		};

		let count = {
			let state = tty.state.borrow();
			state.tx.free_len().min(pending.size)
		};

		let mut chunk = vec![0u8; count];
		if tty
			.kernel
			.read_msg(tty.port, pending.msgid, &mut chunk, MSG_HEADER_SIZE)
			.is_err()
		{
			error!("tty: write transfer failed");
			let _ = tty
				.kernel
				.reply_msg(tty.port, pending.msgid, -(errno::EFAULT as isize), &[]);
			tty.state.borrow_mut().write_slot = None;
			continue;
		}

		for &byte in &chunk {
			tty.tx_put(byte).await;
		}

		// The slot may have been cleared by an abort while the output
		// mapping slept on TX space; the abort handler already replied.
		let still_pending = {
			let state = tty.state.borrow();
			state
				.write_slot
				.is_some_and(|slot| slot.msgid == pending.msgid)
		};
		if still_pending {
			if let Err(err) = tty
				.kernel
				.reply_msg(tty.port, pending.msgid, count as isize, &[])
			{
				error!("tty: write reply failed: {err}");
			}
			tty.state.borrow_mut().write_slot = None;
		}
	}
}

/// Sub-secretary moving TX ring bytes into the device FIFO.
async fn uart_tx_task(tty: Rc<Tty>) {
	loop {
		loop {
			let ready = {
				let state = tty.state.borrow();
				!state.tx.is_empty() && tty.hw.write_ready()
			};
			if ready {
				break;
			}
			tty.rendez.tx.sleep().await;
		}

		let mut drained = false;
		loop {
			let byte = {
				let mut state = tty.state.borrow_mut();
				if state.tx.is_empty() || !tty.hw.write_ready() {
					break;
				}
				state.tx.pop()
			};
			if let Some(byte) = byte {
				tty.hw.write_byte(byte);
				drained = true;
			}
		}

		if drained {
			tty.rendez.tx_free.wakeup_all();
		}
	}
}

/// Sub-secretary feeding received bytes through the line discipline.
async fn uart_rx_task(tty: Rc<Tty>) {
	loop {
		loop {
			let ready = {
				let state = tty.state.borrow();
				state.rx.free_len() > 0 && tty.hw.read_ready()
			};
			if ready {
				break;
			}
			tty.rendez.rx.sleep().await;
		}

		loop {
			let ready = {
				let state = tty.state.borrow();
				state.rx.free_len() > 0 && tty.hw.read_ready()
			};
			if !ready {
				break;
			}
			let byte = tty.hw.read_byte();
			discipline::input_byte(&tty, byte).await;
		}

		let wake = {
			let state = tty.state.borrow();
			if state.termios.lflags().contains(LocalFlags::ICANON) {
				state.line_count > 0
			} else {
				!state.rx.is_empty()
			}
		};
		if wake {
			tty.rendez.rx_data.wakeup_all();
		}
	}
}

/// Length of the line at the head of the RX ring, terminator included.
fn line_length(state: &TtyState) -> usize {
	for idx in 0..state.rx.len() {
		let byte = state.rx.byte_at(idx).unwrap();
		if state.termios.is_line_terminator(byte) {
			return idx + 1;
		}
	}
	state.rx.len()
}
