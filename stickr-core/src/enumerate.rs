//! Finds attached USB devices that can be driven as bulk-only mass storage.
use crate::usb::{DeviceId, EndpointInfo, InterfaceInfo, TransferType, UsbDeviceInfo, UsbHost};
use log::warn;
use std::fmt;
use std::io;

/// One bulk-only mass-storage interface on an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MassStorageCandidate {
    pub id: DeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

/// What a device picker shows for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub display_name: String,
    pub manufacturer: String,
    /// `VVVV:PPPP` in upper-case hex.
    pub vid_pid: String,
    pub id: DeviceId,
}

impl MassStorageCandidate {
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            display_name: self
                .product
                .clone()
                .unwrap_or_else(|| "USB Device".to_string()),
            manufacturer: self
                .manufacturer
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            vid_pid: format!("{:04X}:{:04X}", self.vendor_id, self.product_id),
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<10} {} ({} • {})",
            self.id.0, self.display_name, self.manufacturer, self.vid_pid
        )
    }
}

impl fmt::Display for MassStorageCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.summary().fmt(f)
    }
}

/// The bulk IN and OUT endpoint addresses of `interface`, if it has exactly
/// one of each.
fn bulk_pair(interface: &InterfaceInfo) -> Option<(u8, u8)> {
    let (ins, outs): (Vec<&EndpointInfo>, Vec<&EndpointInfo>) = interface
        .endpoints
        .iter()
        .filter(|ep| ep.transfer_type == TransferType::Bulk)
        .partition(|ep| ep.is_in());
    match (ins.as_slice(), outs.as_slice()) {
        ([ep_in], [ep_out]) => Some((ep_in.address, ep_out.address)),
        _ => None,
    }
}

fn candidates_of(device: &UsbDeviceInfo) -> impl Iterator<Item = MassStorageCandidate> + '_ {
    device
        .interfaces
        .iter()
        .filter(|interface| interface.is_bulk_only_mass_storage())
        .filter_map(move |interface| {
            if interface.endpoints.len() != 2 {
                warn!(
                    "{}: interface {} has {} endpoints",
                    device.id,
                    interface.number,
                    interface.endpoints.len()
                );
            }
            let Some((endpoint_in, endpoint_out)) = bulk_pair(interface) else {
                warn!(
                    "{}: interface {} lacks exactly one bulk IN and one bulk OUT endpoint, skipping",
                    device.id, interface.number
                );
                return None;
            };
            Some(MassStorageCandidate {
                id: device.id.clone(),
                vendor_id: device.vendor_id,
                product_id: device.product_id,
                manufacturer: device.manufacturer.clone(),
                product: device.product.clone(),
                interface: interface.number,
                endpoint_in,
                endpoint_out,
            })
        })
}

/// Scans every attached device for bulk-only mass-storage interfaces.
///
/// Interfaces with the right class triple but the wrong endpoints are logged
/// and skipped; they never stop the scan of other devices. The result is
/// ordered by device id and interface number, so repeated calls with the
/// same hardware attached return the same list.
pub fn list_candidates(host: &dyn UsbHost) -> io::Result<Vec<MassStorageCandidate>> {
    let devices = host.devices()?;
    let mut candidates: Vec<_> = devices.iter().flat_map(candidates_of).collect();
    candidates.sort_by(|a, b| (&a.id, a.interface).cmp(&(&b.id, b.interface)));
    Ok(candidates)
}

/// Picks the candidate a user selected by its stable id.
pub fn find_candidate<'a>(
    candidates: &'a [MassStorageCandidate],
    id: &DeviceId,
) -> Option<&'a MassStorageCandidate> {
    candidates.iter().find(|c| &c.id == id)
}
