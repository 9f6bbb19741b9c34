//! USB access through sysfs and usbdevfs.
//!
//! Descriptors come from `/sys/bus/usb/devices`, where every attached device
//! has a directory named after its port path (`1-2`, `1-2.4`, ...) and every
//! interface a subdirectory `<port>:<config>.<interface>`. Transfers go
//! through ioctls on the device node `/dev/bus/usb/BBB/DDD`.
use crate::usb::{
    ClaimRequest, ControlRequest, DeviceId, EndpointInfo, InterfaceInfo, TransferType,
    UsbChannel, UsbDeviceInfo, UsbHost,
};
use libc::{c_int, c_uint, c_void};
use log::{debug, warn};
use nix::request_code_none;
use nix::unistd::{AccessFlags, access};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const SYSFS_DEVICES: &str = "/sys/bus/usb/devices";
const USBFS_ROOT: &str = "/dev/bus/usb";

const CONTROL_TIMEOUT_MS: u32 = 5_000;
const BULK_TIMEOUT_MS: c_uint = 20_000;

mod sys {
    use libc::{c_int, c_uint, c_void};
    use nix::{ioctl_read, ioctl_readwrite};

    #[repr(C)]
    pub struct CtrlTransfer {
        pub b_request_type: u8,
        pub b_request: u8,
        pub w_value: u16,
        pub w_index: u16,
        pub w_length: u16,
        pub timeout: u32,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct BulkTransfer {
        pub ep: c_uint,
        pub len: c_uint,
        pub timeout: c_uint,
        pub data: *mut c_void,
    }

    #[repr(C)]
    pub struct UsbIoctl {
        pub ifno: c_int,
        pub ioctl_code: c_int,
        pub data: *mut c_void,
    }

    ioctl_readwrite!(usbdevfs_control, b'U', 0, CtrlTransfer);
    ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
    ioctl_read!(usbdevfs_claim_interface, b'U', 15, c_uint);
    ioctl_read!(usbdevfs_release_interface, b'U', 16, c_uint);
    ioctl_readwrite!(usbdevfs_ioctl, b'U', 18, UsbIoctl);
}

use sys::{
    BulkTransfer, CtrlTransfer, UsbIoctl, usbdevfs_bulk, usbdevfs_claim_interface, usbdevfs_control,
    usbdevfs_ioctl, usbdevfs_release_interface,
};

const USBDEVFS_DISCONNECT: c_int = request_code_none!(b'U', 22) as c_int;
const USBDEVFS_CONNECT: c_int = request_code_none!(b'U', 23) as c_int;

/// [`UsbHost`] for Linux.
#[derive(Debug, Clone)]
pub struct LinuxUsbHost {
    sysfs: PathBuf,
    usbfs: PathBuf,
}

impl Default for LinuxUsbHost {
    fn default() -> Self {
        LinuxUsbHost::new()
    }
}

impl LinuxUsbHost {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_DEVICES, USBFS_ROOT)
    }

    /// A host reading descriptors below `sysfs` and device nodes below
    /// `usbfs` instead of the system locations.
    pub fn with_roots(sysfs: impl Into<PathBuf>, usbfs: impl Into<PathBuf>) -> Self {
        LinuxUsbHost {
            sysfs: sysfs.into(),
            usbfs: usbfs.into(),
        }
    }

    fn node(&self, id: &DeviceId) -> io::Result<PathBuf> {
        let dir = self.sysfs.join(&id.0);
        let bus: u16 = parse_dec(&read_attr(&dir, "busnum")?)?;
        let dev: u16 = parse_dec(&read_attr(&dir, "devnum")?)?;
        Ok(self.usbfs.join(format!("{bus:03}")).join(format!("{dev:03}")))
    }

    fn read_device(&self, dir: &Path, name: &str) -> io::Result<UsbDeviceInfo> {
        let mut interfaces = Vec::new();
        let prefix = format!("{name}:");
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            match read_interface(&entry.path()) {
                Ok(interface) => interfaces.push(interface),
                Err(e) => debug!("{}: unreadable interface: {e}", entry.path().display()),
            }
        }
        interfaces.sort_by_key(|interface| interface.number);

        Ok(UsbDeviceInfo {
            id: DeviceId(name.to_string()),
            vendor_id: parse_hex(&read_attr(dir, "idVendor")?)?,
            product_id: parse_hex(&read_attr(dir, "idProduct")?)?,
            manufacturer: read_attr(dir, "manufacturer").ok(),
            product: read_attr(dir, "product").ok(),
            interfaces,
        })
    }
}

/// The block device usb-storage created for a stick, as seen before the
/// driver is detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDisk {
    /// Kernel name, e.g. `sdb`.
    pub name: String,
    pub size_bytes: u64,
    /// Where the disk or one of its partitions is mounted.
    pub mount_points: Vec<PathBuf>,
}

impl KernelDisk {
    pub fn is_mounted(&self) -> bool {
        !self.mount_points.is_empty()
    }
}

impl LinuxUsbHost {
    /// Looks up the block device bound to `id`, its size and mount points.
    ///
    /// `None` when no driver has bound the stick, which is also the case
    /// right after a previous run detached it.
    pub fn kernel_disk(&self, id: &DeviceId) -> io::Result<Option<KernelDisk>> {
        let Some((name, sectors)) = self.block_device(id)? else {
            return Ok(None);
        };
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mount_points = mount_points_of(
            &name,
            disks.iter().map(|disk| (disk.name(), disk.mount_point())),
        );
        Ok(Some(KernelDisk {
            name,
            // sysfs always counts 512-byte sectors.
            size_bytes: sectors * 512,
            mount_points,
        }))
    }

    fn block_device(&self, id: &DeviceId) -> io::Result<Option<(String, u64)>> {
        let prefix = format!("{id}:");
        for entry in fs::read_dir(&self.sysfs)? {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            if let Some(found) = find_block(&entry.path(), BLOCK_SEARCH_DEPTH)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// interface/hostN/targetN:0:0/N:0:0:0/block
const BLOCK_SEARCH_DEPTH: usize = 4;

fn find_block(dir: &Path, depth: usize) -> io::Result<Option<(String, u64)>> {
    let block = dir.join("block");
    if block.is_dir() {
        if let Some(entry) = fs::read_dir(&block)?.next() {
            let entry = entry?;
            let sectors = parse_dec(&read_attr(&entry.path(), "size")?)?;
            return Ok(Some((entry.file_name().to_string_lossy().to_string(), sectors)));
        }
    }
    if depth == 0 {
        return Ok(None);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // Links such as `driver` and `subsystem` point back up the tree.
        if entry.file_type()?.is_dir() {
            if let Some(found) = find_block(&entry.path(), depth - 1)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

fn mount_points_of<'a>(
    disk: &str,
    mounts: impl IntoIterator<Item = (&'a OsStr, &'a Path)>,
) -> Vec<PathBuf> {
    mounts
        .into_iter()
        .filter(|(device, _)| {
            Path::new(device)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| is_disk_or_partition(name, disk))
        })
        .map(|(_, mount_point)| mount_point.to_path_buf())
        .collect()
}

/// `sdb`, `sdb1` and `mmcblk0p2` belong to their disk; `sdba` does not.
fn is_disk_or_partition(name: &str, disk: &str) -> bool {
    name.strip_prefix(disk).is_some_and(|rest| {
        let rest = rest.strip_prefix('p').unwrap_or(rest);
        rest.chars().all(|c| c.is_ascii_digit())
    })
}

fn read_attr(dir: &Path, name: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(name)).map(|s| s.trim().to_string())
}

fn invalid(value: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected sysfs value {value:?}"),
    )
}

fn parse_hex<T: TryFrom<u32>>(value: &str) -> io::Result<T> {
    u32::from_str_radix(value, 16)
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| invalid(value))
}

fn parse_dec<T: std::str::FromStr>(value: &str) -> io::Result<T> {
    value.parse().map_err(|_| invalid(value))
}

fn read_interface(dir: &Path) -> io::Result<InterfaceInfo> {
    let mut endpoints = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("ep_") {
            continue;
        }
        let path = entry.path();
        endpoints.push(EndpointInfo {
            address: parse_hex(&read_attr(&path, "bEndpointAddress")?)?,
            transfer_type: TransferType::from_attributes(parse_hex(&read_attr(
                &path,
                "bmAttributes",
            )?)?),
        });
    }
    endpoints.sort_by_key(|ep| ep.address);

    Ok(InterfaceInfo {
        number: parse_hex(&read_attr(dir, "bInterfaceNumber")?)?,
        class: parse_hex(&read_attr(dir, "bInterfaceClass")?)?,
        subclass: parse_hex(&read_attr(dir, "bInterfaceSubClass")?)?,
        protocol: parse_hex(&read_attr(dir, "bInterfaceProtocol")?)?,
        endpoints,
    })
}

/// Issues one of the driver-binding requests wrapped by `USBDEVFS_IOCTL`.
fn driver_ioctl(fd: c_int, interface: u8, code: c_int) -> nix::Result<c_int> {
    let mut request = UsbIoctl {
        ifno: c_int::from(interface),
        ioctl_code: code,
        data: std::ptr::null_mut(),
    };
    // SAFETY: `request` outlives the call and carries no data buffer.
    unsafe { usbdevfs_ioctl(fd, &mut request) }
}

/// Hands the interface back to the kernel driver.
fn reattach(fd: c_int, interface: u8) {
    if let Err(errno) = driver_ioctl(fd, interface, USBDEVFS_CONNECT) {
        debug!("re-attaching kernel driver to interface {interface}: {errno}");
    }
}

impl UsbHost for LinuxUsbHost {
    fn devices(&self) -> io::Result<Vec<UsbDeviceInfo>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.sysfs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Interfaces live next to devices in this directory.
            if name.contains(':') {
                continue;
            }
            match self.read_device(&entry.path(), &name) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("{name}: skipping device with unreadable descriptors: {e}"),
            }
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    fn has_permission(&self, id: &DeviceId) -> bool {
        match self.node(id) {
            Ok(node) => access(&node, AccessFlags::R_OK | AccessFlags::W_OK).is_ok(),
            Err(_) => false,
        }
    }

    fn claim(&self, id: &DeviceId, request: ClaimRequest) -> io::Result<Box<dyn UsbChannel>> {
        let node = self.node(id)?;
        let file = OpenOptions::new().read(true).write(true).open(&node)?;
        let fd = file.as_raw_fd();

        // Unbind usb-storage so the interface can be claimed.
        if let Err(errno) = driver_ioctl(fd, request.interface, USBDEVFS_DISCONNECT) {
            // ENODATA: no driver was bound.
            debug!("{id}: detaching kernel driver: {errno}");
        }

        let mut interface = c_uint::from(request.interface);
        // SAFETY: `interface` is a valid c_uint for the duration of the call.
        if let Err(errno) = unsafe { usbdevfs_claim_interface(fd, &mut interface) } {
            reattach(fd, request.interface);
            return Err(errno.into());
        }
        debug!("{id}: claimed interface {} via {}", request.interface, node.display());

        Ok(Box::new(LinuxUsbChannel {
            file,
            interface: request.interface,
            endpoint_in: request.endpoint_in,
            endpoint_out: request.endpoint_out,
            claimed: true,
        }))
    }
}

/// A claimed interface on an open usbdevfs node.
pub struct LinuxUsbChannel {
    file: File,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    claimed: bool,
}

impl LinuxUsbChannel {
    fn bulk(&mut self, endpoint: u8, data: *mut c_void, len: usize) -> io::Result<usize> {
        let len = c_uint::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too large"))?;
        let mut transfer = BulkTransfer {
            ep: c_uint::from(endpoint),
            len,
            timeout: BULK_TIMEOUT_MS,
            data,
        };
        // SAFETY: `data` points to at least `len` bytes owned by the caller
        // for the duration of the call.
        let n = unsafe { usbdevfs_bulk(self.file.as_raw_fd(), &mut transfer) }
            .map_err(io::Error::from)?;
        Ok(n as usize)
    }
}

impl UsbChannel for LinuxUsbChannel {
    fn control_in(&mut self, request: ControlRequest, buf: &mut [u8]) -> io::Result<usize> {
        let w_length = u16::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "control buffer too large"))?;
        let mut transfer = CtrlTransfer {
            b_request_type: request.request_type,
            b_request: request.request,
            w_value: request.value,
            w_index: request.index,
            w_length,
            timeout: CONTROL_TIMEOUT_MS,
            data: buf.as_mut_ptr().cast(),
        };
        // SAFETY: `buf` is valid for `w_length` bytes for the duration of the call.
        let n = unsafe { usbdevfs_control(self.file.as_raw_fd(), &mut transfer) }
            .map_err(io::Error::from)?;
        Ok(n as usize)
    }

    fn bulk_out(&mut self, data: &[u8]) -> io::Result<usize> {
        // usbdevfs only reads from the buffer of an OUT transfer.
        let endpoint = self.endpoint_out;
        self.bulk(endpoint, data.as_ptr().cast_mut().cast(), data.len())
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = self.endpoint_in;
        self.bulk(endpoint, buf.as_mut_ptr().cast(), buf.len())
    }

    fn close(&mut self) {
        if !self.claimed {
            return;
        }
        self.claimed = false;
        let fd = self.file.as_raw_fd();

        let mut interface = c_uint::from(self.interface);
        // SAFETY: `interface` is a valid c_uint for the duration of the call.
        if let Err(errno) = unsafe { usbdevfs_release_interface(fd, &mut interface) } {
            warn!("releasing interface {}: {errno}", self.interface);
        }

        reattach(fd, self.interface);
    }
}

impl Drop for LinuxUsbChannel {
    fn drop(&mut self) {
        self.close();
    }
}
