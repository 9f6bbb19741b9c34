//! USB host primitives and the bulk-only mass-storage transport built on them.
//!
//! The host side is abstracted by two traits so the transport can run on any
//! platform USB stack (and against an in-memory device in tests):
//!
//! - [`UsbHost`] lists attached devices with their descriptors, answers
//!   permission queries, and claims an interface.
//! - [`UsbChannel`] is a claimed interface: one control pipe plus the bulk IN
//!   and OUT endpoints of the mass-storage interface.
//!
//! Mass-storage devices expose one interface with class `0x08` (mass
//! storage), subclass `0x06` (SCSI transparent command set) and protocol
//! `0x50` (bulk-only transport). Everything after claiming it is SCSI
//! commands wrapped in command block wrappers, see [`bot`] and [`scsi`].

pub mod bot;
pub mod mass_storage;
pub mod scsi;

use std::fmt;
use std::io;

pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const SUBCLASS_SCSI_TRANSPARENT: u8 = 0x06;
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

/// Stable key for an attached device, used for permission checks and for
/// matching a selection back to a device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decodes the low two bits of `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer_type: TransferType,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl InterfaceInfo {
    pub fn is_bulk_only_mass_storage(&self) -> bool {
        self.class == CLASS_MASS_STORAGE
            && self.subclass == SUBCLASS_SCSI_TRANSPARENT
            && self.protocol == PROTOCOL_BULK_ONLY
    }
}

/// One attached device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub interfaces: Vec<InterfaceInfo>,
}

/// A class-specific control request on the claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Which interface and endpoints to claim on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

pub trait UsbHost: Send + Sync {
    /// Every device currently attached.
    fn devices(&self) -> io::Result<Vec<UsbDeviceInfo>>;

    /// Whether the process may talk to `id` right now. Transfers to a device
    /// without permission must never be attempted.
    fn has_permission(&self, id: &DeviceId) -> bool;

    /// Claims an interface and returns a channel to its endpoints.
    fn claim(&self, id: &DeviceId, request: ClaimRequest) -> io::Result<Box<dyn UsbChannel>>;
}

pub trait UsbChannel: Send {
    /// Device-to-host control transfer; returns the number of bytes received.
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> io::Result<usize>;

    /// One bulk OUT transfer; returns the number of bytes sent.
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<usize>;

    /// One bulk IN transfer; returns the number of bytes received.
    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Releases the interface. Called exactly once by the transport.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_direction_and_type() {
        let ep = EndpointInfo {
            address: 0x81,
            transfer_type: TransferType::from_attributes(0x02),
        };
        assert!(ep.is_in());
        assert_eq!(ep.transfer_type, TransferType::Bulk);
        assert_eq!(TransferType::from_attributes(0x03), TransferType::Interrupt);
        assert!(!EndpointInfo { address: 0x02, ..ep }.is_in());
    }
}
