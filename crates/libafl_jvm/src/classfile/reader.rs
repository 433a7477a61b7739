//! Big-endian cursor over class file bytes, and the matching writer helpers.

use crate::Error;

/// Reads big-endian integers from a byte slice, failing with [`Error::Structural`] on truncation.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// The current offset into the underlying data
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Takes the next `len` bytes
    pub fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(Error::structural(format!(
                "unexpected end of data at offset {} reading {what} ({len} bytes wanted, {} left)",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Skips `len` bytes
    pub fn skip(&mut self, len: usize, what: &str) -> Result<(), Error> {
        self.bytes(len, what).map(|_| ())
    }

    /// Reads an unsigned byte
    pub fn u8(&mut self, what: &str) -> Result<u8, Error> {
        Ok(self.bytes(1, what)?[0])
    }

    /// Reads a signed byte
    pub fn i8(&mut self, what: &str) -> Result<i8, Error> {
        Ok(self.u8(what)? as i8)
    }

    /// Reads a big-endian `u16`
    pub fn u16(&mut self, what: &str) -> Result<u16, Error> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian `i16`
    pub fn i16(&mut self, what: &str) -> Result<i16, Error> {
        Ok(self.u16(what)? as i16)
    }

    /// Reads a big-endian `u32`
    pub fn u32(&mut self, what: &str) -> Result<u32, Error> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `i32`
    pub fn i32(&mut self, what: &str) -> Result<i32, Error> {
        Ok(self.u32(what)? as i32)
    }

    /// Reads a big-endian `u64`
    pub fn u64(&mut self, what: &str) -> Result<u64, Error> {
        let b = self.bytes(8, what)?;
        let mut buf = [0; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// Fails unless every byte has been consumed
    pub fn finish(&self, what: &str) -> Result<(), Error> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Error::structural(format!(
                "{} trailing bytes after {what}",
                self.remaining()
            )))
        }
    }
}

/// Big-endian append helpers for building class file bytes.
pub trait WriteBytes {
    /// Appends one byte
    fn put_u8(&mut self, value: u8);
    /// Appends a big-endian `u16`
    fn put_u16(&mut self, value: u16);
    /// Appends a big-endian `u32`
    fn put_u32(&mut self, value: u32);
    /// Appends a big-endian `i32`
    fn put_i32(&mut self, value: i32) {
        self.put_u32(value as u32);
    }
    /// Appends a big-endian `u64`
    fn put_u64(&mut self, value: u64);
}

impl WriteBytes for Vec<u8> {
    #[inline]
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    #[inline]
    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    fn put_u64(&mut self, value: u64) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}

/// Converts a length to the `u16` count prefix the class file format uses.
pub fn u16_len(len: usize, what: &str) -> Result<u16, Error> {
    u16::try_from(len).map_err(|_| Error::capacity(format!("too many {what}: {len} > 65535")))
}

#[cfg(test)]
mod tests {
    use crate::{
        Error,
        classfile::reader::{ByteReader, WriteBytes},
    };

    #[test]
    fn test_reader_truncation() {
        let mut out = vec![];
        out.put_u16(0xcafe);
        out.put_i32(-2);
        let mut reader = ByteReader::new(&out);
        assert_eq!(reader.u16("magic").unwrap(), 0xcafe);
        assert_eq!(reader.i32("value").unwrap(), -2);
        reader.finish("test").unwrap();
        assert!(matches!(reader.u8("more"), Err(Error::Structural(_, _))));
    }
}
