//! Builds the two-partition MBR used by the Ventoy-style layout.
//!
//! The table places a bootable data partition at the 1 MiB boundary and a
//! fixed 32 MiB EFI system partition in the last sectors of the device:
//!
//! ```text
//! sector 0        MBR (boot code + partition table)
//! sector 1..2047  core image
//! 2048..          data partition (type 0x07)
//! last 65536      system partition (type 0xEF)
//! ```
use crate::error::{FlashError, Result, Shortfall};

pub const SECTOR_SIZE: usize = 512;
pub const BOOT_CODE_LEN: usize = 446;
/// First sector of the data partition (1 MiB alignment).
pub const DATA_PARTITION_START: u64 = 2048;
/// Size of the system partition in sectors (32 MiB).
pub const SYSTEM_PARTITION_SECTORS: u64 = 65536;

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_LEN: usize = 16;
const SIGNATURE_OFFSET: usize = 510;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

pub const STATUS_BOOTABLE: u8 = 0x80;
pub const TYPE_EXFAT_NTFS: u8 = 0x07;
pub const TYPE_EFI_SYSTEM: u8 = 0xEF;

/// Sector geometry of the data and system partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub data_start: u64,
    pub data_sectors: u64,
    pub system_start: u64,
    pub system_sectors: u64,
}

impl PartitionLayout {
    /// Lays out a device of `total_blocks` sectors: the data partition takes
    /// everything between the alignment gap and the trailing system partition.
    pub fn compute(total_blocks: u64) -> Result<Self> {
        let minimum = SYSTEM_PARTITION_SECTORS + DATA_PARTITION_START;
        if total_blocks <= minimum {
            return Err(FlashError::DeviceTooSmall(Shortfall::SystemPartition {
                total_blocks,
                minimum,
            }));
        }
        if total_blocks > u64::from(u32::MAX) {
            return Err(FlashError::DeviceTooSmall(Shortfall::MbrAddressing {
                total_blocks,
            }));
        }

        let data_sectors = total_blocks - SYSTEM_PARTITION_SECTORS - DATA_PARTITION_START;
        Ok(PartitionLayout {
            data_start: DATA_PARTITION_START,
            data_sectors,
            system_start: DATA_PARTITION_START + data_sectors,
            system_sectors: SYSTEM_PARTITION_SECTORS,
        })
    }

    /// One past the last sector covered by the layout.
    pub fn end(&self) -> u64 {
        self.system_start + self.system_sectors
    }
}

/// One decoded 16-byte partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionEntry {
    pub status: u8,
    pub kind: u8,
    pub lba_start: u32,
    pub sectors: u32,
}

impl PartitionEntry {
    /// Decodes an entry; CHS fields are ignored.
    pub fn parse(raw: &[u8; PARTITION_ENTRY_LEN]) -> Self {
        PartitionEntry {
            status: raw[0],
            kind: raw[4],
            lba_start: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == 0 && self.sectors == 0
    }

    fn encode(&self) -> [u8; PARTITION_ENTRY_LEN] {
        // CHS start/end stay zero, LBA addressing only.
        let mut raw = [0u8; PARTITION_ENTRY_LEN];
        raw[0] = self.status;
        raw[4] = self.kind;
        raw[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        raw[12..16].copy_from_slice(&self.sectors.to_le_bytes());
        raw
    }
}

/// Builds the MBR sector for `layout`.
///
/// `boot_code` fills bytes 0..446. Shorter boot code is zero-filled and
/// longer boot code (a full 512-byte boot sector) is cut at the partition
/// table.
pub fn build_mbr(boot_code: &[u8], layout: &PartitionLayout) -> Result<[u8; SECTOR_SIZE]> {
    let lba = |v: u64| {
        u32::try_from(v).map_err(|_| {
            FlashError::DeviceTooSmall(Shortfall::MbrAddressing {
                total_blocks: layout.end(),
            })
        })
    };

    let data = PartitionEntry {
        status: STATUS_BOOTABLE,
        kind: TYPE_EXFAT_NTFS,
        lba_start: lba(layout.data_start)?,
        sectors: lba(layout.data_sectors)?,
    };
    let system = PartitionEntry {
        status: 0x00,
        kind: TYPE_EFI_SYSTEM,
        lba_start: lba(layout.system_start)?,
        sectors: lba(layout.system_sectors)?,
    };

    let mut sector = [0u8; SECTOR_SIZE];
    let code_len = boot_code.len().min(BOOT_CODE_LEN);
    sector[..code_len].copy_from_slice(&boot_code[..code_len]);

    for (index, entry) in [data, system].iter().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;
        sector[offset..offset + PARTITION_ENTRY_LEN].copy_from_slice(&entry.encode());
    }
    sector[SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);

    Ok(sector)
}

/// Decodes the four primary partition entries of an MBR sector, or `None` if
/// the boot signature is missing.
pub fn parse_partitions(sector: &[u8; SECTOR_SIZE]) -> Option<[PartitionEntry; 4]> {
    if sector[SIGNATURE_OFFSET..] != BOOT_SIGNATURE {
        return None;
    }
    let mut entries = [PartitionEntry::default(); 4];
    for (index, entry) in entries.iter_mut().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;
        let mut raw = [0u8; PARTITION_ENTRY_LEN];
        raw.copy_from_slice(&sector[offset..offset + PARTITION_ENTRY_LEN]);
        *entry = PartitionEntry::parse(&raw);
    }
    Some(entries)
}
