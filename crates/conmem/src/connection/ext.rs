//! Typed and chunked helpers layered on top of raw `read_bytes`/`write_bytes`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Connection, check_span};
use crate::error::{Error, Result};

/// Fixed-size numeric values decoded per the connection's endianness
pub trait Primitive: Sized + Copy + Send + Sync + 'static {
    const SIZE: usize;

    fn from_bytes(bytes: &[u8], little_endian: bool) -> Self;

    fn to_bytes(self, little_endian: bool) -> Vec<u8>;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_bytes(bytes: &[u8], little_endian: bool) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    if little_endian {
                        <$ty>::from_le_bytes(raw)
                    } else {
                        <$ty>::from_be_bytes(raw)
                    }
                }

                fn to_bytes(self, little_endian: bool) -> Vec<u8> {
                    if little_endian {
                        self.to_le_bytes().to_vec()
                    } else {
                        self.to_be_bytes().to_vec()
                    }
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Convenience operations available on every [`Connection`].
#[async_trait]
pub trait ConnectionExt: Connection {
    async fn read_value<T: Primitive>(&self, address: u32) -> Result<T> {
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::SIZE];
        self.read_bytes(address, raw).await?;
        Ok(T::from_bytes(raw, self.is_little_endian()))
    }

    async fn write_value<T: Primitive>(&self, address: u32, value: T) -> Result<()> {
        let raw = value.to_bytes(self.is_little_endian());
        self.write_bytes(address, &raw).await
    }

    async fn read_u8(&self, address: u32) -> Result<u8> {
        self.read_value(address).await
    }

    async fn read_u16(&self, address: u32) -> Result<u16> {
        self.read_value(address).await
    }

    async fn read_u32(&self, address: u32) -> Result<u32> {
        self.read_value(address).await
    }

    async fn read_u64(&self, address: u32) -> Result<u64> {
        self.read_value(address).await
    }

    async fn read_f32(&self, address: u32) -> Result<f32> {
        self.read_value(address).await
    }

    async fn read_f64(&self, address: u32) -> Result<f64> {
        self.read_value(address).await
    }

    async fn write_u8(&self, address: u32, value: u8) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn write_u16(&self, address: u32, value: u16) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn write_u32(&self, address: u32, value: u32) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn write_u64(&self, address: u32, value: u64) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn write_f32(&self, address: u32, value: f32) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn write_f64(&self, address: u32, value: f64) -> Result<()> {
        self.write_value(address, value).await
    }

    async fn read_vec(&self, address: u32, count: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; count];
        self.read_bytes(address, &mut buffer).await?;
        Ok(buffer)
    }

    /// Read `count` bytes as ASCII, dropping NUL characters
    async fn read_string(&self, address: u32, count: usize) -> Result<String> {
        let bytes = self.read_vec(address, count).await?;
        Ok(bytes
            .into_iter()
            .filter(|&b| b != 0)
            .map(|b| if b.is_ascii() { b as char } else { '?' })
            .collect())
    }

    /// Write `text` as ASCII; characters outside ASCII become `?`
    async fn write_string(&self, address: u32, text: &str) -> Result<()> {
        let bytes: Vec<u8> = text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        self.write_bytes(address, &bytes).await
    }

    /// Read in pieces of at most `chunk_size`, checking `cancel` between pieces
    async fn read_bytes_chunked(
        &self,
        address: u32,
        buffer: &mut [u8],
        chunk_size: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        check_span(address, buffer.len())?;
        let chunk_size = chunk_size.max(1);
        let mut offset = 0usize;
        for chunk in buffer.chunks_mut(chunk_size) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }
            self.read_bytes(address.wrapping_add(offset as u32), chunk).await?;
            offset += chunk.len();
        }
        Ok(())
    }

    async fn write_bytes_chunked(
        &self,
        address: u32,
        data: &[u8],
        chunk_size: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        check_span(address, data.len())?;
        let chunk_size = chunk_size.max(1);
        let mut offset = 0usize;
        for chunk in data.chunks(chunk_size) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }
            self.write_bytes(address.wrapping_add(offset as u32), chunk).await?;
            offset += chunk.len();
        }
        Ok(())
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
