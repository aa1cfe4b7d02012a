//! Field-ordered binary buffers for step state dump/load. The format
//! is fixed by the recovery protocol, so fields are written and read
//! explicitly rather than through a derived serialiser.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("unexpected end of state buffer")]
    Truncated,
    #[error("malformed state field: {0}")]
    Malformed(String),
}

#[derive(Default)]
pub struct PackBuffer {
    buf: BytesMut,
}

impl PackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_time(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    /// Length-prefixed optional string; zero length marks absence.
    pub fn put_str(&mut self, s: Option<&str>) {
        match s {
            None => self.buf.put_u32(0),
            Some(s) => {
                self.buf.put_u32(s.len() as u32 + 1);
                self.buf.put_slice(s.as_bytes());
            }
        }
    }

    /// Current write position, usable with [`Self::patch_u32`].
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Overwrite a u32 written earlier (record-count placeholders).
    pub fn patch_u32(&mut self, position: usize, v: u32) {
        self.buf[position..position + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

pub struct UnpackBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> UnpackBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        UnpackBuffer { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PackError> {
        if self.pos + len > self.data.len() {
            return Err(PackError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, PackError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, PackError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, PackError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, PackError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_time(&mut self) -> Result<i64, PackError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_str(&mut self) -> Result<Option<String>, PackError> {
        let len = self.get_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(len - 1)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| PackError::Malformed("string is not valid utf-8".to_string()))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
