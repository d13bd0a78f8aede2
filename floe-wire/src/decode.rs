//! Bounds-checked cursor over received bytes.
//!
//! Every read fails with [`Error::Protocol`] instead of panicking; malformed
//! input from the peer must never take the process down.

use bytes::Bytes;
use floe_types::Error;

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self, what: &str) -> Error {
        Error::Protocol(format!("truncated {what}"))
    }

    pub fn read_slice(&mut self, len: usize, what: &str) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(self.truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_bytes(&mut self, len: usize, what: &str) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self.read_slice(len, what)?))
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_slice(1, "byte")?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let bytes = self.read_slice(4, "u32")?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, Error> {
        let bytes = self.read_slice(4, "i32")?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, Error> {
        let bytes = self.read_slice(8, "i64")?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Legacy compact size: one byte below 255, else `0xFF` + u32 LE.
    pub fn read_ice_size(&mut self) -> Result<usize, Error> {
        let first = self.read_u8()?;
        if first < 0xFF {
            Ok(first as usize)
        } else {
            Ok(self.read_u32_le()? as usize)
        }
    }

    pub fn read_ice_string(&mut self) -> Result<String, Error> {
        let len = self.read_ice_size()?;
        let bytes = self.read_slice(len, "string")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Protocol("invalid utf-8".into()))
    }

    /// 2-bit-prefix variable-length integer, 1/2/4/8 bytes big-endian.
    pub fn read_varuint62(&mut self) -> Result<u64, Error> {
        let first = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.truncated("varuint"))?;
        let width = 1usize << (first >> 6);
        let bytes = self.read_slice(width, "varuint")?;
        let mut value = u64::from(bytes[0] & 0x3F);
        for byte in &bytes[1..] {
            value = (value << 8) | u64::from(*byte);
        }
        Ok(value)
    }

    pub fn read_varuint32(&mut self) -> Result<u32, Error> {
        let value = self.read_varuint62()?;
        u32::try_from(value).map_err(|_| Error::Protocol("varuint32 out of range".into()))
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_varuint62()? as usize;
        let bytes = self.read_slice(len, "string")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Protocol("invalid utf-8".into()))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(&self.buf[self.pos..]);
        self.pos = self.buf.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_reads_fail_cleanly() {
        let mut dec = Decoder::new(&[1, 2]);
        assert!(matches!(dec.read_u32_le(), Err(Error::Protocol(_))));
        // Failed read consumes nothing.
        assert_eq!(dec.remaining(), 2);
        assert_eq!(dec.read_u8().unwrap(), 1);
    }

    #[test]
    fn invalid_utf8_is_a_protocol_error() {
        let mut dec = Decoder::new(&[2, 0xC3, 0x28]);
        assert!(matches!(dec.read_string(), Err(Error::Protocol(_))));
    }

    #[test]
    fn rest_drains_the_buffer() {
        let mut dec = Decoder::new(&[9, 8, 7]);
        dec.read_u8().unwrap();
        assert_eq!(dec.rest().as_ref(), &[8, 7]);
        assert!(dec.is_empty());
    }
}
