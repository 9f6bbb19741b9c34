//! Opening image files, decompressing them first when needed.
//!
//! A device write needs the exact image length up front, which compressed
//! formats do not record reliably. Compressed images are therefore inflated
//! into a temporary file before the device is touched.
use crate::error::{FlashError, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Guesses the compression from the file extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// A readable image with a known length.
///
/// If the image had to be decompressed, the temporary file lives as long as
/// this value and is deleted on drop.
#[derive(Debug)]
pub struct ImageSource {
    file: File,
    len: u64,
    temp: Option<NamedTempFile>,
}

impl ImageSource {
    /// Opens `path`, decompressing `.gz`, `.xz` and `.zst` images.
    ///
    /// `on_decompress_progress` receives the number of decompressed bytes so
    /// far. Clearing `running` aborts decompression with
    /// [`io::ErrorKind::Interrupted`].
    pub fn open<F>(path: &Path, running: &AtomicBool, mut on_decompress_progress: F) -> Result<Self>
    where
        F: FnMut(u64),
    {
        let input = File::open(path)?;
        let compression = Compression::from_path(path);
        debug!("{}: {compression:?}", path.display());

        let mut reader: Box<dyn Read> = match compression {
            Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input))),
            Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input))),
            Compression::Zstd => Box::new(ZstdDecoder::new(input)?),
            Compression::None => {
                let len = input.metadata()?.len();
                return Ok(ImageSource {
                    file: input,
                    len,
                    temp: None,
                });
            }
        };

        let mut temp = NamedTempFile::new()?;
        let mut total: u64 = 0;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let mut buffer = vec![0u8; BUFFER_SIZE];
            loop {
                if !running.load(Ordering::SeqCst) {
                    return Err(FlashError::Io(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "decompression cancelled",
                    )));
                }
                let n = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                writer.write_all(&buffer[..n])?;
                total += n as u64;
                on_decompress_progress(total);
            }
            writer.flush()?;
        }
        info!("decompressed {} to {total} bytes", path.display());

        let mut file = temp.reopen()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(ImageSource {
            file,
            len: total,
            temp: Some(temp),
        })
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_decompressed(&self) -> bool {
        self.temp.is_some()
    }
}
