use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
    sync::Mutex,
};

use crate::{error::ShoalError, types::ShoalResult};

/// A seekable file behind a mutex. The page file does all its disk traffic
/// through this wrapper so offset arithmetic and the seek/read pair stay in
/// one place.
pub struct ShoalFile {
    file: Mutex<File>,
}

impl ShoalFile {
    pub fn open<P: AsRef<Path>>(file_path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn get_size(&self) -> io::Result<u64> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.set_len(len)
    }

    /// Durability barrier: all prior writes are persisted when this returns.
    pub fn sync(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()
    }
}

pub fn read_exact_buf<R: Read>(reader: &mut R, bytes_count: usize) -> ShoalResult<Vec<u8>> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .map_err(|e| ShoalError::Corruption {
            page_id: crate::storage::page::NO_PAGE,
            detail: format!("short read, expect {} bytes: {}", bytes_count, e),
        })?;
    Ok(buffer)
}

pub fn read_into<T: Decodeable, R: Read>(reader: &mut R) -> ShoalResult<T> {
    T::decode_from(reader)
}

/// An append-only byte buffer for building page images and wire records.
pub struct ShoalWriter {
    buf: Vec<u8>,
}

impl ShoalWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn to_padded_bytes(mut self, size: usize) -> Vec<u8> {
        assert!(
            self.buf.len() <= size,
            "buffer size is larger than the given size: {} > {}",
            self.buf.len(),
            size,
        );
        self.buf.resize(size, 0);
        self.buf
    }
}

impl Default for ShoalWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self>;
}

impl Encodeable for [u8] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

/// # Format
///
/// - 2 bytes: string size, big-endian
/// - n bytes: utf-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let size = u16::decode_from(reader)?;
        let bytes = read_exact_buf(reader, size as usize)?;
        String::from_utf8(bytes).map_err(|e| ShoalError::Corruption {
            page_id: crate::storage::page::NO_PAGE,
            detail: format!("invalid utf-8 string: {}", e),
        })
    }
}

// All on-disk multi-byte integers are big-endian.
macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_be_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
                    let bytes = read_exact_buf(reader, size_of::<Self>())?;
                    Ok(Self::from_be_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);
