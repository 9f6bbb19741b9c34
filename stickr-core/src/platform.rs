//! Platform USB backends.
//!
//! Each backend implements [`UsbHost`](crate::usb::UsbHost) on top of the
//! operating system's raw USB access. Only Linux is supported for now; on
//! other targets a front-end has to bring its own host.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

/// The USB host of the platform this was built for.
#[cfg(target_os = "linux")]
pub fn default_host() -> LinuxUsbHost {
    LinuxUsbHost::new()
}
