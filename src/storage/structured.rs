//! Typed little-endian writers and readers over storage files.
//!
//! Every file written through [`StructWriter`] ends with a CRC32 footer of
//! the preceding bytes, which [`StructReader::verify_footer`] checks.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{IrisError, Result};
use crate::storage::{StorageInput, StorageOutput};

/// Binary writer with checksum tracking.
#[derive(Debug)]
pub struct StructWriter {
    output: Box<dyn StorageOutput>,
    hasher: Hasher,
    written: u64,
}

impl StructWriter {
    pub fn new(output: Box<dyn StorageOutput>) -> Self {
        StructWriter {
            output,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u32::<LittleEndian>(value)?;
        self.put(&buf)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u64::<LittleEndian>(value)?;
        self.put(&buf)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.write_i64::<LittleEndian>(value)?;
        self.put(&buf)
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.write_f64::<LittleEndian>(value)?;
        self.put(&buf)
    }

    /// LEB128 variable-length unsigned integer.
    pub fn write_varint(&mut self, mut value: u64) -> Result<()> {
        let mut buf = [0u8; 10];
        let mut len = 0;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                buf[len] = byte;
                len += 1;
                break;
            }
            buf[len] = byte | 0x80;
            len += 1;
        }
        self.put(&buf[..len])
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put(bytes)
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.put(value.as_bytes())
    }

    /// Bytes written so far, excluding the footer.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Write the checksum footer and close the underlying output.
    pub fn close(mut self) -> Result<u64> {
        let checksum = self.hasher.clone().finalize();
        self.output.write_u32::<LittleEndian>(checksum)?;
        self.output.close()?;
        Ok(self.written + 4)
    }
}

/// Binary reader matching [`StructWriter`].
#[derive(Debug)]
pub struct StructReader {
    input: Box<dyn StorageInput>,
    hasher: Hasher,
}

impl StructReader {
    pub fn new(input: Box<dyn StorageInput>) -> Self {
        StructReader {
            input,
            hasher: Hasher::new(),
        }
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf)?;
        self.hasher.update(&buf);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.as_slice().read_u32::<LittleEndian>()?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.as_slice().read_u64::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.take(8)?.as_slice().read_i64::<LittleEndian>()?)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.take(8)?.as_slice().read_f64::<LittleEndian>()?)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(IrisError::index("varint is too long"));
            }
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes).map_err(|e| IrisError::index(format!("invalid UTF-8: {e}")))
    }

    /// Read the footer and compare it against the bytes consumed so far.
    pub fn verify_footer(mut self) -> Result<()> {
        let expected = self.hasher.clone().finalize();
        let actual = self.input.read_u32::<LittleEndian>()?;
        if expected != actual {
            return Err(IrisError::index(format!(
                "checksum mismatch: expected {expected:#010x}, found {actual:#010x}"
            )));
        }
        Ok(())
    }
}
