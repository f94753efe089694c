//! Host controller tests against the register-level EMMC model: bring-up,
//! card identification, data transfer, retries and failure injection.

mod common;

use std::rc::Rc;

use common::EmmcModel;
use osprey_drivers::drivers::sd::{SdConfig, SdError, SdHost, SdVersion};
use osprey_drivers::errno;
use osprey_drivers::sys::dma::DmaBuffer;
use osprey_drivers::sys::mock::MockKernel;
use osprey_drivers::sys::Kernel;

const CAPACITY_BLOCKS: u64 = 32 * 1024;

fn host_on(model: &Rc<EmmcModel>) -> (Rc<MockKernel>, SdHost) {
	host_with_config(model, SdConfig::default())
}

fn host_with_config(model: &Rc<EmmcModel>, config: SdConfig) -> (Rc<MockKernel>, SdHost) {
	let kernel = Rc::new(MockKernel::new());
	let dyn_kernel: Rc<dyn Kernel> = kernel.clone();
	let host = SdHost::new(dyn_kernel, model.clone(), config);
	(kernel, host)
}

fn pattern(seed: u8) -> [u8; 512] {
	let mut block = [0u8; 512];
	for (idx, byte) in block.iter_mut().enumerate() {
		*byte = seed.wrapping_add(idx as u8);
	}
	block
}

#[test]
fn init_identifies_a_v2_card() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (kernel, mut host) = host_on(&model);

	host.init().expect("card identification");

	assert_eq!(host.rca(), 0x1234);
	assert!(host.is_sdhc());
	assert_eq!(host.version(), SdVersion::V3);
	assert_eq!(host.capacity_blocks(), CAPACITY_BLOCKS);
	assert_eq!(host.base_clock(), 100_000_000);
	assert_eq!(host.last_error(), 0);
	// The card was power-cycled through the mailbox before bring-up.
	assert_eq!(kernel.power_transitions(), vec![(0, false), (0, true)]);
}

#[test]
fn init_handles_a_v1_card() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| state.v1_card = true);
	let (_kernel, mut host) = host_on(&model);

	host.init().expect("v1 card identification");
	assert!(!host.is_sdhc());
}

#[test]
fn init_retries_while_the_card_is_busy() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| state.acmd41_busy = 2);
	let (kernel, mut host) = host_on(&model);

	host.init().expect("busy card identification");
	// Two busy polls cost two 500 ms sleeps on the virtual clock.
	assert!(kernel.now_micros() >= 1_000_000);
}

#[test]
fn init_fails_without_a_card() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| state.card_present = false);
	let (_kernel, mut host) = host_on(&model);

	assert_eq!(host.init(), Err(SdError::NoCard));
}

#[test]
fn init_fails_on_a_dead_controller() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| state.dead = true);
	let (_kernel, mut host) = host_on(&model);

	assert!(matches!(host.init(), Err(SdError::Identification(_))));
}

#[test]
fn read_write_round_trip() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();

	let data = pattern(0x40);
	assert_eq!(host.write(&data, 100), Ok(512));

	let mut readback = [0u8; 512];
	assert_eq!(host.read(&mut readback, 100), Ok(512));
	assert_eq!(readback, data);
	assert_eq!(host.last_error(), 0);

	// Reading the same range again returns identical bytes.
	let mut again = [0u8; 512];
	host.read(&mut again, 100).unwrap();
	assert_eq!(again, readback);
}

#[test]
fn multi_block_transfers_use_one_command() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();

	let mut data = vec![0u8; 4096];
	for (idx, byte) in data.iter_mut().enumerate() {
		*byte = (idx % 251) as u8;
	}
	assert_eq!(host.write(&data, 64), Ok(4096));

	let commands_before = model.with_state(|state| state.command_log.len());
	let mut readback = vec![0u8; 4096];
	assert_eq!(host.read(&mut readback, 64), Ok(4096));
	assert_eq!(readback, data);

	// One SEND_STATUS plus one READ_MULTIPLE_BLOCK.
	let log = model.with_state(|state| state.command_log.clone());
	let issued: Vec<u32> = log[commands_before..]
		.iter()
		.map(|cmd| cmd >> 24 & 0x3f)
		.collect();
	assert_eq!(issued, vec![13, 18]);
}

#[test]
fn rejects_partial_block_buffers() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();

	let mut short = [0u8; 100];
	assert_eq!(
		host.read(&mut short, 0),
		Err(SdError::BadBufferSize(100))
	);
	let odd = [0u8; 700];
	assert_eq!(host.write(&odd, 0), Err(SdError::BadBufferSize(700)));
}

#[test]
fn data_errors_are_retried() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();
	model.write_block(7, &pattern(0x11));

	model.with_state(|state| state.fail_data_commands = 2);
	let mut readback = [0u8; 512];
	assert_eq!(host.read(&mut readback, 7), Ok(512));
	assert_eq!(readback, pattern(0x11));
}

#[test]
fn exhausted_retries_clear_the_rca_and_reinit_recovers() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();
	model.write_block(9, &pattern(0x22));

	model.with_state(|state| state.fail_data_commands = 3);
	let mut readback = [0u8; 512];
	let err = host.read(&mut readback, 9).unwrap_err();
	assert!(matches!(err, SdError::Command { .. }));
	assert_eq!(err.errno(), errno::EIO);

	// The failed operation dropped the RCA; the next request re-initialises
	// the card and succeeds.
	assert_eq!(host.read(&mut readback, 9), Ok(512));
	assert_eq!(readback, pattern(0x22));
}

#[test]
fn card_removal_poisons_until_reinit() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();
	model.write_block(3, &pattern(0x33));

	model.inject_card_removal();
	let mut readback = [0u8; 512];
	let err = host.read(&mut readback, 3).unwrap_err();
	assert_eq!(err.errno(), errno::ENODEV);

	// The card is still in the slot; re-initialisation brings it back.
	assert_eq!(host.read(&mut readback, 3), Ok(512));
	assert_eq!(readback, pattern(0x33));
}

#[test]
fn abort_fails_the_command_with_eintr() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();

	host.request_abort();
	let mut readback = [0u8; 512];
	let err = host.read(&mut readback, 0).unwrap_err();
	assert_eq!(err, SdError::Interrupted);
	assert_eq!(err.errno(), errno::EINTR);

	host.clear_abort();
	assert_eq!(host.read(&mut readback, 0), Ok(512));
}

#[test]
fn sdma_failure_falls_back_to_pio() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| state.fail_dma = true);
	let (kernel, mut host) = host_with_config(
		&model,
		SdConfig {
			power_cycle: true,
			enable_sdma: true,
		},
	);
	host.init().unwrap();
	model.write_block(5, &pattern(0x55));

	// A 4 KiB-aligned buffer makes the first attempt eligible for SDMA; the
	// stuck transfer is aborted and the retry runs PIO.
	let dyn_kernel: Rc<dyn Kernel> = kernel.clone();
	let mut aligned = DmaBuffer::new(dyn_kernel, 512).unwrap();
	assert_eq!(host.read(aligned.as_mut_slice(), 5), Ok(512));
	assert_eq!(aligned.as_slice(), &pattern(0x55)[..]);

	// The stuck SDMA transfer was cancelled with STOP_TRANSMISSION.
	let log = model.with_state(|state| state.command_log.clone());
	assert!(log.iter().any(|cmd| cmd >> 24 & 0x3f == 12));
}

#[test]
fn byte_addressing_for_legacy_cards() {
	let model = EmmcModel::new(CAPACITY_BLOCKS);
	model.with_state(|state| {
		state.v1_card = true;
		state.sdhc = false;
	});
	let (_kernel, mut host) = host_on(&model);
	host.init().unwrap();
	model.write_block(2, &pattern(0x77));

	let mut readback = [0u8; 512];
	assert_eq!(host.read(&mut readback, 2), Ok(512));
	assert_eq!(readback, pattern(0x77));
}
