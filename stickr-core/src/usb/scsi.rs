//! The handful of SCSI commands a USB flash drive needs.
//!
//! Command descriptor blocks are big-endian, unlike the bulk-only wrappers
//! that carry them.
use std::fmt;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8A;
pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
const SA_READ_CAPACITY_16: u8 = 0x10;

pub const INQUIRY_LEN: usize = 36;
pub const SENSE_LEN: usize = 18;
pub const READ_CAPACITY_10_LEN: usize = 8;
pub const READ_CAPACITY_16_LEN: usize = 32;

pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_UNIT_ATTENTION: u8 = 0x06;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

pub fn test_unit_ready() -> [u8; 6] {
    [TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn request_sense() -> [u8; 6] {
    [REQUEST_SENSE, 0, 0, 0, SENSE_LEN as u8, 0]
}

pub fn inquiry() -> [u8; 6] {
    [INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0]
}

pub fn read_capacity_10() -> [u8; 10] {
    [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn read_capacity_16() -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = SERVICE_ACTION_IN_16;
    cdb[1] = SA_READ_CAPACITY_16;
    cdb[10..14].copy_from_slice(&(READ_CAPACITY_16_LEN as u32).to_be_bytes());
    cdb
}

/// READ(10)/WRITE(10) when every addressed block fits 32 bits,
/// READ(16)/WRITE(16) otherwise. `blocks` is at most `u16::MAX`; callers
/// split larger transfers.
pub fn read_write(write: bool, lba: u64, blocks: u16) -> Vec<u8> {
    let fits_10 = lba
        .checked_add(u64::from(blocks))
        .is_some_and(|end| end <= 1 << 32);
    match u32::try_from(lba).ok().filter(|_| fits_10) {
        Some(lba) => {
            let mut cdb = vec![0u8; 10];
            cdb[0] = if write { WRITE_10 } else { READ_10 };
            cdb[2..6].copy_from_slice(&lba.to_be_bytes());
            cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
            cdb
        }
        None => {
            let mut cdb = vec![0u8; 16];
            cdb[0] = if write { WRITE_16 } else { READ_16 };
            cdb[2..10].copy_from_slice(&lba.to_be_bytes());
            cdb[10..14].copy_from_slice(&u32::from(blocks).to_be_bytes());
            cdb
        }
    }
}

/// Logical block address and transfer length of a READ/WRITE CDB.
pub fn parse_read_write(cdb: &[u8]) -> Option<(u64, u32)> {
    match cdb.first()? {
        &READ_10 | &WRITE_10 if cdb.len() >= 10 => Some((
            u64::from(be32(&cdb[2..6])),
            u32::from(u16::from_be_bytes([cdb[7], cdb[8]])),
        )),
        &READ_16 | &WRITE_16 if cdb.len() >= 16 => {
            let mut lba = [0u8; 8];
            lba.copy_from_slice(&cdb[2..10]);
            Some((u64::from_be_bytes(lba), be32(&cdb[10..14])))
        }
        _ => None,
    }
}

fn be32(raw: &[u8]) -> u32 {
    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Fixed-format sense data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 14 {
            return None;
        }
        Some(Sense {
            key: raw[2] & 0x0F,
            asc: raw[12],
            ascq: raw[13],
        })
    }

    pub fn to_bytes(&self) -> [u8; SENSE_LEN] {
        let mut raw = [0u8; SENSE_LEN];
        raw[0] = 0x70;
        raw[2] = self.key & 0x0F;
        raw[7] = (SENSE_LEN - 8) as u8;
        raw[12] = self.asc;
        raw[13] = self.ascq;
        raw
    }

    pub fn is_medium_not_present(&self) -> bool {
        self.key == SENSE_NOT_READY && self.asc == ASC_MEDIUM_NOT_PRESENT
    }

    pub fn is_unit_attention(&self) -> bool {
        self.key == SENSE_UNIT_ATTENTION
    }
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sense key {:#04x}, asc {:#04x}, ascq {:#04x}",
            self.key, self.asc, self.ascq
        )
    }
}

/// Vendor and product strings from a standard INQUIRY response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inquiry {
    pub vendor: String,
    pub product: String,
}

impl Inquiry {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 32 {
            return None;
        }
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
        Some(Inquiry {
            vendor: text(&raw[8..16]),
            product: text(&raw[16..32]),
        })
    }
}

/// Capacity as `(last_lba, block_size)` from READ CAPACITY(10).
pub fn parse_capacity_10(raw: &[u8]) -> Option<(u64, u32)> {
    if raw.len() < READ_CAPACITY_10_LEN {
        return None;
    }
    Some((u64::from(be32(&raw[0..4])), be32(&raw[4..8])))
}

/// Capacity as `(last_lba, block_size)` from READ CAPACITY(16).
pub fn parse_capacity_16(raw: &[u8]) -> Option<(u64, u32)> {
    if raw.len() < 12 {
        return None;
    }
    let mut lba = [0u8; 8];
    lba.copy_from_slice(&raw[0..8]);
    Some((u64::from_be_bytes(lba), be32(&raw[8..12])))
}
