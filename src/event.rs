//! The per-driver event loop.
//!
//! One loop iteration waits on the event queue, services interrupt events
//! through the device adapter's bottom half, drains every ready message port
//! FIFO into the driver's dispatch table, runs the cooperative scheduler dry
//! and only then re-arms the interrupt. New events raised while handling are
//! therefore observed before the line is unmasked.

use std::rc::Rc;
use std::time::Duration;

use zerocopy::FromBytes;

use crate::drivers::DriverError;
use crate::errno;
use crate::executor::Executor;
use crate::sys::{Event, Kernel, MsgHeader, MsgId, PortId, MSG_HEADER_SIZE};

/// A driver's half of the event loop: per-message dispatch and interrupt
/// handling.
pub trait Dispatch {
	/// Handles one drained request. Client-level failures are replied to
	/// inside; only driver-fatal conditions surface as errors.
	fn handle_message(
		&self,
		token: usize,
		port: PortId,
		msgid: MsgId,
		header: &MsgHeader,
	) -> Result<(), DriverError>;

	/// Bottom half of the device interrupt; `bits` is the thread-event mask.
	fn handle_interrupt(&self, bits: u32);

	/// Re-arms the device interrupt, after the scheduler has drained.
	fn unmask_interrupt(&self);

	/// Called when the wait timed out with no event pending.
	fn poll_device(&self) {}
}

pub struct EventLoop {
	kernel: Rc<dyn Kernel>,
	executor: Rc<Executor>,
	poll_interval: Option<Duration>,
}

impl EventLoop {
	pub fn new(
		kernel: Rc<dyn Kernel>,
		executor: Rc<Executor>,
		poll_interval: Option<Duration>,
	) -> Self {
		Self {
			kernel,
			executor,
			poll_interval,
		}
	}

	/// Runs until the SIGTERM handler sets the shutdown flag.
	pub fn run(&self, driver: &dyn Dispatch) -> Result<(), DriverError> {
		while self.poll_once(driver)? {}
		info!("event loop: shutdown requested");
		Ok(())
	}

	/// One iteration: wait, service, drain, re-arm. Returns `false` once
	/// shutdown has been requested.
	pub fn poll_once(&self, driver: &dyn Dispatch) -> Result<bool, DriverError> {
		let events = self.kernel.wait_events(self.poll_interval)?;

		if events.is_empty() {
			driver.poll_device();
		}

		for event in &events {
			match *event {
				Event::Thread { bits } => driver.handle_interrupt(bits),
				Event::Port { port, token } => self.drain_port(driver, port, token)?,
			}
		}

		if self.kernel.shutdown_requested() {
			return Ok(false);
		}

		self.executor.drain();
		driver.unmask_interrupt();
		Ok(true)
	}

	/// Drains one port FIFO, dispatching each request in arrival order.
	fn drain_port(
		&self,
		driver: &dyn Dispatch,
		port: PortId,
		token: usize,
	) -> Result<(), DriverError> {
		let mut buf = [0u8; MSG_HEADER_SIZE];
		while let Some((msgid, len)) = self.kernel.get_msg(port, &mut buf)? {
			let Ok(header) = MsgHeader::read_from_bytes(&buf[..len]) else {
				warn!("port {port}: truncated request header ({len} bytes)");
				self.kernel.reply_msg(port, msgid, -(errno::EINVAL as isize), &[])?;
				continue;
			};
			driver.handle_message(token, port, msgid, &header)?;
		}
		Ok(())
	}
}
