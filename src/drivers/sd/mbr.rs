//! Master Boot Record partition table.
//!
//! Sector 0 carries four packed 16-byte partition entries at offset 446.
//! Only primary partitions exist at this level; an entry with type 0 is
//! unused.

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Offset of the partition table within sector 0.
pub const PARTITION_TABLE_OFFSET: usize = 446;
pub const PARTITION_ENTRY_COUNT: usize = 4;

/// One on-disk partition table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PartitionEntry {
	pub state: u8,
	pub chs_start: [u8; 3],
	pub partition_type: u8,
	pub chs_end: [u8; 3],
	start_lba: U32,
	size_sectors: U32,
}

impl PartitionEntry {
	/// Whether the slot holds a partition.
	pub fn is_used(&self) -> bool {
		self.partition_type != 0
	}

	pub fn start_lba(&self) -> u32 {
		self.start_lba.get()
	}

	/// Partition size in 512-byte sectors.
	pub fn size_sectors(&self) -> u32 {
		self.size_sectors.get()
	}
}

/// Extracts the four partition entries from sector 0.
pub fn partition_entries(sector: &[u8; 512]) -> [PartitionEntry; PARTITION_ENTRY_COUNT] {
	let mut entries = [PartitionEntry {
		state: 0,
		chs_start: [0; 3],
		partition_type: 0,
		chs_end: [0; 3],
		start_lba: U32::new(0),
		size_sectors: U32::new(0),
	}; PARTITION_ENTRY_COUNT];

	for (idx, entry) in entries.iter_mut().enumerate() {
		let offset = PARTITION_TABLE_OFFSET + idx * std::mem::size_of::<PartitionEntry>();
		*entry = PartitionEntry::read_from_bytes(&sector[offset..offset + 16])
			.expect("16-byte slice matches the entry layout");
	}
	entries
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Writes an entry the way fdisk lays it out.
	fn put_entry(sector: &mut [u8; 512], slot: usize, kind: u8, start_lba: u32, sectors: u32) {
		let offset = PARTITION_TABLE_OFFSET + slot * 16;
		sector[offset + 4] = kind;
		sector[offset + 8..offset + 12].copy_from_slice(&start_lba.to_le_bytes());
		sector[offset + 12..offset + 16].copy_from_slice(&sectors.to_le_bytes());
	}

	#[test]
	fn parses_primary_partitions() {
		let mut sector = [0u8; 512];
		put_entry(&mut sector, 0, 0x83, 2048, 4096);
		put_entry(&mut sector, 1, 0x0c, 8192, 8192);

		let entries = partition_entries(&sector);
		assert!(entries[0].is_used());
		assert_eq!(entries[0].partition_type, 0x83);
		assert_eq!(entries[0].start_lba(), 2048);
		assert_eq!(entries[0].size_sectors(), 4096);
		assert!(entries[1].is_used());
		assert_eq!(entries[1].start_lba(), 8192);
		assert!(!entries[2].is_used());
		assert!(!entries[3].is_used());
	}

	#[test]
	fn entry_layout_is_packed() {
		assert_eq!(std::mem::size_of::<PartitionEntry>(), 16);
	}
}
