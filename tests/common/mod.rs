//! Register-level device models and fixtures shared by the integration
//! suites. The models implement `MmioIo`, so the drivers run unmodified
//! against them on top of `MockKernel`.

#![allow(dead_code)]

pub mod emmc_model;
pub mod uart_model;

use std::rc::Rc;

use osprey_drivers::blk::BlkDriver;
use osprey_drivers::config::{DriverConfig, TtyParams};
use osprey_drivers::drivers::sd::{SdConfig, SdHost};
use osprey_drivers::drivers::uart::miniuart::MiniUart;
use osprey_drivers::event::EventLoop;
use osprey_drivers::executor::Executor;
use osprey_drivers::sys::mock::MockKernel;
use osprey_drivers::sys::Kernel;
use osprey_drivers::tty::{TtyDriver, POLL_INTERVAL};

pub use emmc_model::EmmcModel;
pub use uart_model::MiniUartModel;

pub const UART_IRQ: u32 = 93;

pub struct TtyFixture {
	pub kernel: Rc<MockKernel>,
	pub executor: Rc<Executor>,
	pub uart: Rc<MiniUartModel>,
	pub driver: TtyDriver,
	pub events: EventLoop,
}

pub fn tty_fixture() -> TtyFixture {
	let kernel = Rc::new(MockKernel::new());
	let dyn_kernel: Rc<dyn Kernel> = kernel.clone();
	let executor = Executor::new();
	let uart = Rc::new(MiniUartModel::new());

	let hw = Rc::new(MiniUart::new(dyn_kernel.clone(), uart.clone(), UART_IRQ));
	let config = DriverConfig {
		pathname: "/dev/tty0".to_string(),
		uid: 0,
		gid: 0,
		mode: 0o666,
		dev: 4,
	};
	let driver = TtyDriver::new(
		dyn_kernel.clone(),
		executor.clone(),
		hw,
		&config,
		&TtyParams::default(),
	)
	.expect("tty driver init");

	let events = EventLoop::new(dyn_kernel, executor.clone(), Some(POLL_INTERVAL));
	TtyFixture {
		kernel,
		executor,
		uart,
		driver,
		events,
	}
}

pub struct BlkFixture {
	pub kernel: Rc<MockKernel>,
	pub executor: Rc<Executor>,
	pub emmc: Rc<EmmcModel>,
	pub driver: BlkDriver,
	pub events: EventLoop,
}

pub fn blk_fixture(emmc: Rc<EmmcModel>) -> BlkFixture {
	let kernel = Rc::new(MockKernel::new());
	let dyn_kernel: Rc<dyn Kernel> = kernel.clone();
	let executor = Executor::new();

	let host = SdHost::new(dyn_kernel.clone(), emmc.clone(), SdConfig::default());
	let config = DriverConfig {
		pathname: "/dev/sd".to_string(),
		uid: 0,
		gid: 0,
		mode: 0o600,
		dev: 2,
	};
	let driver = BlkDriver::new(dyn_kernel.clone(), executor.clone(), host, &config)
		.expect("blk driver init");

	let events = EventLoop::new(dyn_kernel, executor.clone(), None);
	BlkFixture {
		kernel,
		executor,
		emmc,
		driver,
		events,
	}
}
