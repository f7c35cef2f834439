//! A local file treated as console memory mapped at a base address.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{AddressRange, Connection, FeatureSet, OperationGuard, check_span};
use crate::error::{Error, Result};

/// Reads outside the file come back as zeroes. Writes outside it are dropped unless the
/// connection is resizable, in which case the file grows to fit.
pub struct FileConnection {
    path: PathBuf,
    file: Mutex<Option<File>>,
    base: u32,
    little_endian: bool,
    resizable: bool,
    connected: AtomicBool,
    guard: OperationGuard,
    features: FeatureSet,
}

impl FileConnection {
    pub async fn open<P: AsRef<Path>>(path: P, base: u32, little_endian: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path).await?;
        debug!("Opened memory image {:?} at {:#010X}", path, base);

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            base,
            little_endian,
            resizable: false,
            connected: AtomicBool::new(true),
            guard: OperationGuard::new(),
            features: FeatureSet::new(),
        })
    }

    pub fn resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }

    pub fn base_address(&self) -> u32 {
        self.base
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File-relative `(offset, buffer_start, length)` of the part of a span that falls
    /// inside `[base, base + file_len)`
    fn overlap(&self, address: u32, count: usize, file_len: u64) -> Option<(u64, usize, usize)> {
        let span_start = address as u64;
        let span_end = span_start + count as u64;
        let file_start = self.base as u64;
        let file_end = file_start + file_len;

        let start = span_start.max(file_start);
        let end = span_end.min(file_end);
        (start < end).then(|| {
            (
                start - file_start,
                (start - span_start) as usize,
                (end - start) as usize,
            )
        })
    }
}

#[async_trait]
impl Connection for FileConnection {
    fn connection_type(&self) -> &'static str {
        "File"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    fn addressable_range(&self) -> AddressRange {
        AddressRange::full()
    }

    async fn read_bytes(&self, address: u32, buffer: &mut [u8]) -> Result<()> {
        check_span(address, buffer.len())?;
        let _scope = self.guard.begin()?;
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or(Error::ConnectionClosed)?;

        buffer.fill(0);
        let file_len = file.metadata().await?.len();
        if let Some((offset, start, len)) = self.overlap(address, buffer.len(), file_len) {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buffer[start..start + len]).await?;
        }
        Ok(())
    }

    async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<()> {
        check_span(address, data.len())?;
        let _scope = self.guard.begin()?;
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or(Error::ConnectionClosed)?;

        let file_len = if self.resizable {
            u64::MAX - self.base as u64
        } else {
            file.metadata().await?.len()
        };
        let Some((offset, start, len)) = self.overlap(address, data.len(), file_len) else {
            debug!("Dropped write at {:#010X} outside the image", address);
            return Ok(());
        };

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data[start..start + len]).await?;
        file.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }

    fn features(&self) -> &FeatureSet {
        &self.features
    }
}
