//! The input line discipline.
//!
//! Every byte the UART receive task pulls from the device passes through
//! [`input_byte`]: strip, NL/CR mapping, canonical editing, signal
//! generation, echo, and finally the RX ring. The discipline owns all RX
//! enqueueing and the line accounting of canonical mode. Echo goes through
//! the same TX path as client writes and is the one place here that may
//! suspend, when the TX ring is full.

use bitflags::bitflags;

use super::termios::{
	InputFlags, LocalFlags, VEOF, VEOL, VEOL2, VERASE, VINTR, VKILL, VQUIT,
};
use super::Tty;
use crate::sys::{SIGINT, SIGQUIT};

bitflags! {
	/// Line events recognised while a byte moves through the stages.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub(crate) struct LineFlags: u32 {
		/// The byte terminates a line.
		const EOT = 1 << 0;
		/// The byte is the end-of-file character.
		const EOF = 1 << 1;
	}
}

pub(crate) async fn input_byte(tty: &Tty, raw: u8) {
	let (iflags, lflags) = {
		let state = tty.state.borrow();
		(state.termios.iflags(), state.termios.lflags())
	};

	let mut byte = raw;
	if iflags.contains(InputFlags::ISTRIP) {
		byte &= 0x7f;
	}

	if byte == b'\n' && iflags.contains(InputFlags::INLCR) {
		byte = b'\r';
	} else if byte == b'\r' {
		if iflags.contains(InputFlags::IGNCR) {
			return;
		}
		if iflags.contains(InputFlags::ICRNL) {
			byte = b'\n';
		}
	}

	let mut flags = LineFlags::empty();
	if lflags.contains(LocalFlags::ICANON) {
		let termios = tty.state.borrow().termios;
		if termios.is_cc(VERASE, byte) {
			erase(tty, byte).await;
			return;
		}
		if termios.is_cc(VKILL, byte) {
			kill_line(tty, byte).await;
			return;
		}
		if byte == b'\n' || termios.is_cc(VEOL, byte) || termios.is_cc(VEOL2, byte) {
			flags |= LineFlags::EOT;
		}
		if termios.is_cc(VEOF, byte) {
			flags |= LineFlags::EOT | LineFlags::EOF;
		}
	}

	if lflags.contains(LocalFlags::ISIG) {
		let termios = tty.state.borrow().termios;
		if termios.is_cc(VINTR, byte) {
			tty.notify_signal(SIGINT);
			echo_control(tty, b'C').await;
			return;
		}
		if termios.is_cc(VQUIT, byte) {
			tty.notify_signal(SIGQUIT);
			echo_control(tty, b'\\').await;
			return;
		}
	}

	if lflags.contains(LocalFlags::ECHO) {
		tty.tx_put(byte).await;
	} else if byte == b'\n'
		&& flags.contains(LineFlags::EOT)
		&& lflags.contains(LocalFlags::ICANON)
		&& lflags.contains(LocalFlags::ECHONL)
	{
		tty.tx_put(byte).await;
	}

	let queued = {
		let mut state = tty.state.borrow_mut();
		let queued = state.rx.push(byte);
		if queued && flags.contains(LineFlags::EOT) {
			state.line_count += 1;
		}
		queued
	};
	if !queued {
		// The uart-rx task gates on free space, so this only triggers when
		// editing raced the gate; the byte is dropped, never blocked on.
		debug!("rx ring full, dropped input byte {byte:#04x}");
	}
}

/// Deletes the byte most recently queued on the RX ring, unless the ring is
/// empty or ends in a line terminator. Returns `false` at start of line.
async fn erase(tty: &Tty, erase_byte: u8) -> bool {
	let (deleted, lflags) = {
		let mut state = tty.state.borrow_mut();
		let blocked = match state.rx.peek_tail() {
			None => true,
			Some(tail) => state.termios.is_line_terminator(tail),
		};
		let deleted = if blocked { None } else { state.rx.unpush_tail() };
		(deleted, state.termios.lflags())
	};

	if deleted.is_none() {
		return false;
	}

	if lflags.contains(LocalFlags::ECHO) {
		if lflags.contains(LocalFlags::ECHOE) {
			tty.tx_put_raw(0x08).await;
			tty.tx_put_raw(b' ').await;
			tty.tx_put_raw(0x08).await;
		} else {
			tty.tx_put_raw(erase_byte).await;
		}
	}
	true
}

/// Deletes back to the start of the line.
async fn kill_line(tty: &Tty, kill_byte: u8) {
	let lflags = tty.state.borrow().termios.lflags();
	let mut erased_any = false;

	loop {
		let deleted = {
			let mut state = tty.state.borrow_mut();
			let blocked = match state.rx.peek_tail() {
				None => true,
				Some(tail) => state.termios.is_line_terminator(tail),
			};
			if blocked { None } else { state.rx.unpush_tail() }
		};
		if deleted.is_none() {
			break;
		}
		erased_any = true;

		if lflags.contains(LocalFlags::ECHO) && lflags.contains(LocalFlags::ECHOE) {
			tty.tx_put_raw(0x08).await;
			tty.tx_put_raw(b' ').await;
			tty.tx_put_raw(0x08).await;
		}
	}

	if erased_any && lflags.contains(LocalFlags::ECHO) && !lflags.contains(LocalFlags::ECHOE) {
		tty.tx_put_raw(kill_byte).await;
	}
	if lflags.contains(LocalFlags::ECHOK) {
		tty.tx_put_raw(b'\n').await;
	}
}

/// Echoes a control character in caret notation.
async fn echo_control(tty: &Tty, letter: u8) {
	let lflags = tty.state.borrow().termios.lflags();
	if lflags.contains(LocalFlags::ECHO) {
		tty.tx_put_raw(b'^').await;
		tty.tx_put_raw(letter).await;
	}
}
