//! Userspace device drivers for the Osprey microkernel on the Raspberry Pi 4.
//!
//! Every driver in this crate is a single-threaded process built from the
//! same parts: a cooperative task [`executor`], an [`event`] loop that
//! multiplexes message-port traffic, interrupt events and timeouts, a pair of
//! byte [`collections::RingBuffer`]s connecting client I/O to the hardware
//! FIFOs, and a board-specific device adapter behind a capability trait.
//!
//! The [`tty`] driver serves character devices on top of the AUX mini-UART or
//! the PL011 and carries the canonical-mode line discipline. The [`blk`]
//! driver owns the EMMC host controller, discovers the MBR partition table
//! and publishes one message port per partition.
//!
//! The kernel itself is reached only through the [`sys::Kernel`] trait; the
//! test suite substitutes [`sys::mock::MockKernel`] and register-level device
//! models for it.

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

pub mod blk;
pub mod collections;
pub mod config;
pub mod drivers;
pub mod errno;
pub mod event;
pub mod executor;
pub mod logging;
pub mod sys;
pub mod tty;

pub use crate::drivers::DriverError;
