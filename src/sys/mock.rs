//! An in-process stand-in for the kernel surface.
//!
//! [`MockKernel`] gives the test suite loopback message ports, injectable
//! thread events and a virtual monotonic clock, so whole drivers run
//! unmodified against register-level device models. The clock advances a
//! small tick on every read, which lets the bounded polling loops of the SD
//! driver expire deterministically, and jumps over requested delays and
//! event-wait timeouts instead of sleeping.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use super::{
	DeviceNode, Event, Kernel, MsgHeader, MsgId, NodeStat, PortId, SysError, SysResult,
	MSG_HEADER_SIZE,
};
use crate::errno;

/// Clock advance per [`Kernel::monotonic_micros`] call.
const CLOCK_TICK_USEC: u64 = 10;

#[derive(Debug)]
struct MockPort {
	path: String,
	stat: NodeStat,
	queue: VecDeque<MsgId>,
	token: Option<usize>,
}

#[derive(Debug)]
struct MockMessage {
	port: PortId,
	header: [u8; MSG_HEADER_SIZE],
	payload: Vec<u8>,
	recv: Vec<u8>,
	reply: Option<(isize, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
	ports: Vec<MockPort>,
	messages: AHashMap<MsgId, MockMessage>,
	next_msgid: MsgId,
	thread_events: u32,
	signals: Vec<(PortId, u32, i32)>,
	power_states: Vec<(u32, bool)>,
	unmasked: Vec<u32>,
	interrupt_servers: Vec<(u32, u32)>,
	device_nodes: AHashMap<String, DeviceNode>,
	clock_rates: AHashMap<u32, u32>,
}

#[derive(Default)]
pub struct MockKernel {
	inner: RefCell<Inner>,
	clock: Cell<u64>,
	shutdown: Cell<bool>,
}

impl MockKernel {
	pub fn new() -> Self {
		Self::default()
	}

	// --- test-side client operations ---

	/// Submits a client request; `payload` follows the header in the message
	/// buffer, as `readmsg` sees it.
	pub fn submit(&self, port: PortId, header: &MsgHeader, payload: &[u8]) -> MsgId {
		let mut inner = self.inner.borrow_mut();
		inner.next_msgid += 1;
		let msgid = inner.next_msgid;

		let mut header_bytes = [0u8; MSG_HEADER_SIZE];
		header_bytes.copy_from_slice(header.as_bytes());
		inner.messages.insert(
			msgid,
			MockMessage {
				port,
				header: header_bytes,
				payload: payload.to_vec(),
				recv: Vec::new(),
				reply: None,
			},
		);
		inner.ports[port as usize].queue.push_back(msgid);
		msgid
	}

	/// The reply posted for `msgid`, if any.
	pub fn reply_of(&self, msgid: MsgId) -> Option<(isize, Vec<u8>)> {
		self.inner.borrow().messages.get(&msgid)?.reply.clone()
	}

	/// Everything the driver wrote into the client's receive buffer.
	pub fn recv_bytes(&self, msgid: MsgId) -> Vec<u8> {
		self.inner
			.borrow()
			.messages
			.get(&msgid)
			.map(|msg| msg.recv.clone())
			.unwrap_or_default()
	}

	pub fn port_at(&self, path: &str) -> Option<PortId> {
		let inner = self.inner.borrow();
		inner
			.ports
			.iter()
			.position(|port| port.path == path)
			.map(|idx| idx as PortId)
	}

	pub fn port_paths(&self) -> Vec<String> {
		self.inner
			.borrow()
			.ports
			.iter()
			.map(|port| port.path.clone())
			.collect()
	}

	pub fn port_stat(&self, port: PortId) -> NodeStat {
		self.inner.borrow().ports[port as usize].stat.clone()
	}

	/// Raises thread-event bits, as a fired interrupt server would.
	pub fn raise_thread_event(&self, bits: u32) {
		self.inner.borrow_mut().thread_events |= bits;
	}

	pub fn request_shutdown(&self) {
		self.shutdown.set(true);
	}

	pub fn signals(&self) -> Vec<(PortId, u32, i32)> {
		self.inner.borrow().signals.clone()
	}

	pub fn power_transitions(&self) -> Vec<(u32, bool)> {
		self.inner.borrow().power_states.clone()
	}

	pub fn unmask_count(&self, irq: u32) -> usize {
		self.inner
			.borrow()
			.unmasked
			.iter()
			.filter(|&&line| line == irq)
			.count()
	}

	pub fn interrupt_servers(&self) -> Vec<(u32, u32)> {
		self.inner.borrow().interrupt_servers.clone()
	}

	pub fn add_device_node(&self, node: DeviceNode) {
		self.inner
			.borrow_mut()
			.device_nodes
			.insert(node.path.clone(), node);
	}

	pub fn set_clock_rate(&self, clock_id: u32, hz: u32) {
		self.inner.borrow_mut().clock_rates.insert(clock_id, hz);
	}

	pub fn now_micros(&self) -> u64 {
		self.clock.get()
	}
}

impl Kernel for MockKernel {
	fn create_msgport(&self, path: &str, stat: &NodeStat, _backlog: usize) -> SysResult<PortId> {
		let mut inner = self.inner.borrow_mut();
		if inner.ports.iter().any(|port| port.path == path) {
			return Err(SysError::new(errno::EBUSY));
		}
		inner.ports.push(MockPort {
			path: path.to_string(),
			stat: stat.clone(),
			queue: VecDeque::new(),
			token: None,
		});
		Ok((inner.ports.len() - 1) as PortId)
	}

	fn get_msg(&self, port: PortId, buf: &mut [u8]) -> SysResult<Option<(MsgId, usize)>> {
		let mut inner = self.inner.borrow_mut();
		let slot = inner
			.ports
			.get_mut(port as usize)
			.ok_or(SysError::new(errno::EBADF))?;
		let Some(msgid) = slot.queue.pop_front() else {
			return Ok(None);
		};
		let header = inner.messages[&msgid].header;
		if buf.len() < header.len() {
			return Err(SysError::new(errno::EFAULT));
		}
		buf[..header.len()].copy_from_slice(&header);
		Ok(Some((msgid, header.len())))
	}

	fn reply_msg(&self, port: PortId, msgid: MsgId, status: isize, data: &[u8]) -> SysResult<()> {
		let mut inner = self.inner.borrow_mut();
		let msg = inner
			.messages
			.get_mut(&msgid)
			.ok_or(SysError::new(errno::EINVAL))?;
		if msg.port != port || msg.reply.is_some() {
			return Err(SysError::new(errno::EINVAL));
		}
		msg.reply = Some((status, data.to_vec()));
		Ok(())
	}

	fn read_msg(
		&self,
		port: PortId,
		msgid: MsgId,
		buf: &mut [u8],
		offset: usize,
	) -> SysResult<usize> {
		let inner = self.inner.borrow();
		let msg = inner
			.messages
			.get(&msgid)
			.filter(|msg| msg.port == port)
			.ok_or(SysError::new(errno::EINVAL))?;
		let rel = offset
			.checked_sub(MSG_HEADER_SIZE)
			.ok_or(SysError::new(errno::EFAULT))?;
		let end = rel
			.checked_add(buf.len())
			.filter(|&end| end <= msg.payload.len())
			.ok_or(SysError::new(errno::EFAULT))?;
		buf.copy_from_slice(&msg.payload[rel..end]);
		Ok(buf.len())
	}

	fn write_msg(
		&self,
		port: PortId,
		msgid: MsgId,
		data: &[u8],
		offset: usize,
	) -> SysResult<usize> {
		let mut inner = self.inner.borrow_mut();
		let msg = inner
			.messages
			.get_mut(&msgid)
			.filter(|msg| msg.port == port)
			.ok_or(SysError::new(errno::EINVAL))?;
		if msg.recv.len() < offset + data.len() {
			msg.recv.resize(offset + data.len(), 0);
		}
		msg.recv[offset..offset + data.len()].copy_from_slice(data);
		Ok(data.len())
	}

	fn watch_port(&self, port: PortId, token: usize) -> SysResult<()> {
		let mut inner = self.inner.borrow_mut();
		let slot = inner
			.ports
			.get_mut(port as usize)
			.ok_or(SysError::new(errno::EBADF))?;
		slot.token = Some(token);
		Ok(())
	}

	fn wait_events(&self, timeout: Option<Duration>) -> SysResult<SmallVec<[Event; 4]>> {
		let mut inner = self.inner.borrow_mut();
		let mut events = SmallVec::new();

		if inner.thread_events != 0 {
			events.push(Event::Thread {
				bits: inner.thread_events,
			});
			inner.thread_events = 0;
		}
		for (idx, port) in inner.ports.iter().enumerate() {
			if let Some(token) = port.token {
				if !port.queue.is_empty() {
					events.push(Event::Port {
						port: idx as PortId,
						token,
					});
				}
			}
		}

		if events.is_empty() {
			if let Some(timeout) = timeout {
				self.clock
					.set(self.clock.get() + timeout.as_micros() as u64);
			}
		}
		Ok(events)
	}

	fn add_interrupt_server(&self, irq: u32, event_bit: u32) -> SysResult<()> {
		self.inner
			.borrow_mut()
			.interrupt_servers
			.push((irq, event_bit));
		Ok(())
	}

	fn unmask_interrupt(&self, irq: u32) -> SysResult<()> {
		self.inner.borrow_mut().unmasked.push(irq);
		Ok(())
	}

	fn signal_notify(&self, port: PortId, ino: u32, signo: i32) -> SysResult<()> {
		self.inner.borrow_mut().signals.push((port, ino, signo));
		Ok(())
	}

	fn map_phys_mem(&self, _paddr: u64, _len: usize) -> SysResult<*mut u32> {
		// Register windows in tests are device models, not mappings.
		Err(SysError::new(errno::ENOSYS))
	}

	fn virtual_to_phys(&self, vaddr: *const u8) -> SysResult<u64> {
		Ok(vaddr as u64)
	}

	fn dcache_flush(&self, _vaddr: *const u8, _len: usize) {}

	fn dcache_invalidate(&self, _vaddr: *const u8, _len: usize) {}

	fn monotonic_micros(&self) -> u64 {
		let now = self.clock.get() + CLOCK_TICK_USEC;
		self.clock.set(now);
		now
	}

	fn delay_micros(&self, usec: u64) {
		self.clock.set(self.clock.get() + usec);
	}

	fn set_power_state(&self, device_id: u32, on: bool) -> SysResult<bool> {
		self.inner.borrow_mut().power_states.push((device_id, on));
		Ok(on)
	}

	fn clock_rate(&self, clock_id: u32) -> SysResult<u32> {
		self.inner
			.borrow()
			.clock_rates
			.get(&clock_id)
			.copied()
			.ok_or(SysError::new(errno::ENOSYS))
	}

	fn device_node(&self, path: &str) -> SysResult<DeviceNode> {
		self.inner
			.borrow()
			.device_nodes
			.get(path)
			.cloned()
			.ok_or(SysError::new(errno::ENXIO))
	}

	fn shutdown_requested(&self) -> bool {
		self.shutdown.get()
	}
}
