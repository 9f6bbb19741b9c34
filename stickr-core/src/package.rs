//! The payloads of a Ventoy-style install package.
//!
//! A package carries three files: a boot record, an XZ-compressed core image
//! and an XZ-compressed system partition image. They are recognised by the
//! end of their entry name, so the top-level directory of a release archive
//! (`ventoy-1.0.99/...`) does not matter.
use crate::error::{FlashError, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use xz2::read::XzDecoder;

/// What an installer needs from a package.
#[derive(Debug)]
pub struct Payloads<R = File> {
    /// Only the first 446 bytes are written.
    pub boot_record: Vec<u8>,
    /// Already decompressed.
    pub core_image: Vec<u8>,
    /// Decompressed system partition image.
    pub system_image: R,
    pub system_image_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageEntry {
    BootRecord,
    CoreImage,
    SystemImage,
}

impl PackageEntry {
    pub const ALL: [PackageEntry; 3] = [
        PackageEntry::BootRecord,
        PackageEntry::CoreImage,
        PackageEntry::SystemImage,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            PackageEntry::BootRecord => "boot/boot.img",
            PackageEntry::CoreImage => "boot/core.img.xz",
            PackageEntry::SystemImage => "ventoy/ventoy.disk.img.xz",
        }
    }

    /// Which payload an archive entry holds, if any.
    pub fn classify(name: &str) -> Option<Self> {
        let name = name.replace('\\', "/");
        Self::ALL
            .into_iter()
            .find(|entry| name.ends_with(entry.suffix()))
    }
}

/// Collects payloads from archive entries as they stream past.
#[derive(Debug, Default)]
pub struct PackageAssembler {
    boot_record: Option<Vec<u8>>,
    core_image: Option<Vec<u8>>,
    system_image: Option<(File, u64)>,
}

impl PackageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `reader` if `name` is one of the package payloads. Returns
    /// whether the entry was used. A later entry with the same role replaces
    /// an earlier one.
    pub fn accept<R: Read>(&mut self, name: &str, mut reader: R) -> Result<bool> {
        let Some(entry) = PackageEntry::classify(name) else {
            return Ok(false);
        };
        debug!("package entry {name} is the {entry:?}");
        match entry {
            PackageEntry::BootRecord => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                self.boot_record = Some(data);
            }
            PackageEntry::CoreImage => {
                let mut data = Vec::new();
                XzDecoder::new(reader).read_to_end(&mut data)?;
                self.core_image = Some(data);
            }
            PackageEntry::SystemImage => {
                let mut file = tempfile::tempfile()?;
                let len = io::copy(&mut XzDecoder::new(reader), &mut file)?;
                file.seek(SeekFrom::Start(0))?;
                self.system_image = Some((file, len));
            }
        }
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.boot_record.is_some() && self.core_image.is_some() && self.system_image.is_some()
    }

    /// # Errors
    ///
    /// [`FlashError::PackageIncomplete`] naming every payload not seen.
    pub fn finish(self) -> Result<Payloads> {
        match (self.boot_record, self.core_image, self.system_image) {
            (Some(boot_record), Some(core_image), Some((system_image, system_image_len))) => {
                info!(
                    "package: boot record {} bytes, core image {} bytes, system image {} bytes",
                    boot_record.len(),
                    core_image.len(),
                    system_image_len
                );
                Ok(Payloads {
                    boot_record,
                    core_image,
                    system_image,
                    system_image_len,
                })
            }
            (boot, core, system) => {
                let mut missing = Vec::new();
                if boot.is_none() {
                    missing.push(PackageEntry::BootRecord.suffix());
                }
                if core.is_none() {
                    missing.push(PackageEntry::CoreImage.suffix());
                }
                if system.is_none() {
                    missing.push(PackageEntry::SystemImage.suffix());
                }
                Err(FlashError::PackageIncomplete { missing })
            }
        }
    }
}

impl Payloads {
    /// Reads the payloads from an unpacked package directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut assembler = PackageAssembler::new();
        collect(dir, dir, &mut assembler)?;
        assembler.finish()
    }
}

fn collect(root: &Path, dir: &Path, assembler: &mut PackageAssembler) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(root, &path, assembler)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative.to_string_lossy();
        if PackageEntry::classify(&name).is_some() {
            assembler.accept(&name, File::open(&path)?)?;
        }
    }
    Ok(())
}
