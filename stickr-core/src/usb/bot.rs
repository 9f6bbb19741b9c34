//! Bulk-only transport framing.
//!
//! Every command goes out as a 31-byte command block wrapper (CBW), is
//! followed by an optional data phase, and is answered by a 13-byte command
//! status wrapper (CSW). All multi-byte fields are little-endian.

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

const CBW_SIGNATURE: u32 = 0x4342_5355; // "USBC"
const CSW_SIGNATURE: u32 = 0x5342_5355; // "USBS"

const FLAG_DATA_IN: u8 = 0x80;

/// Class request: how many logical units the device has, minus one.
pub const REQUEST_GET_MAX_LUN: u8 = 0xFE;
/// `bmRequestType` for device-to-host, class, interface recipient.
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_len: u32,
    pub direction: Direction,
    pub lun: u8,
    cdb: [u8; 16],
    cdb_len: u8,
}

impl CommandBlockWrapper {
    /// Wraps a SCSI command descriptor block of at most 16 bytes.
    pub fn new(tag: u32, data_len: u32, direction: Direction, lun: u8, cdb: &[u8]) -> Self {
        let len = cdb.len().min(16);
        let mut block = [0u8; 16];
        block[..len].copy_from_slice(&cdb[..len]);
        CommandBlockWrapper {
            tag,
            data_len,
            direction,
            lun,
            cdb: block,
            cdb_len: len as u8,
        }
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut raw = [0u8; CBW_LEN];
        raw[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_len.to_le_bytes());
        raw[12] = if self.direction == Direction::In {
            FLAG_DATA_IN
        } else {
            0
        };
        raw[13] = self.lun & 0x0F;
        raw[14] = self.cdb_len;
        raw[15..31].copy_from_slice(&self.cdb);
        raw
    }

    /// Decodes a CBW as the device sees it.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() != CBW_LEN || le32(&raw[0..4]) != CBW_SIGNATURE {
            return None;
        }
        let data_len = le32(&raw[8..12]);
        let direction = match (data_len, raw[12] & FLAG_DATA_IN) {
            (0, _) => Direction::None,
            (_, FLAG_DATA_IN) => Direction::In,
            _ => Direction::Out,
        };
        let cdb_len = raw[14].min(16);
        Some(CommandBlockWrapper::new(
            le32(&raw[4..8]),
            data_len,
            direction,
            raw[13] & 0x0F,
            &raw[15..15 + cdb_len as usize],
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Passed,
    Failed,
    PhaseError,
    Reserved(u8),
}

impl From<u8> for CommandStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => CommandStatus::Reserved(other),
        }
    }
}

impl CommandStatus {
    fn to_byte(self) -> u8 {
        match self {
            CommandStatus::Passed => 0,
            CommandStatus::Failed => 1,
            CommandStatus::PhaseError => 2,
            CommandStatus::Reserved(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Decodes a CSW, or `None` if the length or signature is wrong.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() != CSW_LEN || le32(&raw[0..4]) != CSW_SIGNATURE {
            return None;
        }
        Some(CommandStatusWrapper {
            tag: le32(&raw[4..8]),
            residue: le32(&raw[8..12]),
            status: CommandStatus::from(raw[12]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut raw = [0u8; CSW_LEN];
        raw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.residue.to_le_bytes());
        raw[12] = self.status.to_byte();
        raw
    }
}

fn le32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Hands out CBW tags. Zero is skipped so a zeroed CSW never matches.
#[derive(Debug)]
pub struct TagGenerator(u32);

impl TagGenerator {
    pub fn new() -> Self {
        TagGenerator(1)
    }

    pub fn next_tag(&mut self) -> u32 {
        let tag = self.0;
        self.0 = self.0.wrapping_add(1).max(1);
        tag
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
