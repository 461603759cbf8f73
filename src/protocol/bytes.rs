// Copyright (c) 2021-2023 Via Technology Ltd. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A simple de-/serialisation facility for protocol messages.
//!
//! Fixed-width integers are written in network byte order; strings, raw
//! byte payloads and sequences are length-prefixed. Deserialisation is not
//! type-safe: the reader must extract fields in the order the writer put
//! them. Bulk payloads (buffer contents, program source above the message
//! size limit) never travel through this buffer, they ride the bulk channel.

use crate::error::{Error, Result};
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

fn underflow() -> Error {
    Error::Protocol("message buffer underflow".into())
}

/// An append-only write / forward-only read byte buffer.
#[derive(Default)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
    pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.bytes.write_u32::<NetworkEndian>(value).unwrap();
    }

    pub fn put_u64(&mut self, value: u64) {
        self.bytes.write_u64::<NetworkEndian>(value).unwrap();
    }

    pub fn put_i32(&mut self, value: i32) {
        self.bytes.write_i32::<NetworkEndian>(value).unwrap();
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.bytes.extend_from_slice(value);
    }

    pub fn put_u64_vec(&mut self, values: &[u64]) {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_u64(*value);
        }
    }

    pub fn put_string_vec(&mut self, values: &[String]) {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_string(value);
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut reader = &self.bytes[self.pos..];
        let value = reader.read_u8().map_err(|_| underflow())?;
        self.pos += 1;
        Ok(value)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut reader = &self.bytes[self.pos..];
        let value = reader.read_u32::<NetworkEndian>().map_err(|_| underflow())?;
        self.pos += 4;
        Ok(value)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut reader = &self.bytes[self.pos..];
        let value = reader.read_u64::<NetworkEndian>().map_err(|_| underflow())?;
        self.pos += 8;
        Ok(value)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let mut reader = &self.bytes[self.pos..];
        let value = reader.read_i32::<NetworkEndian>().map_err(|_| underflow())?;
        self.pos += 4;
        Ok(value)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_byte_vec()?;
        String::from_utf8(bytes).map_err(|_| Error::Protocol("invalid string encoding".into()))
    }

    pub fn get_byte_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if self.remaining() < len {
            return Err(underflow());
        }
        let bytes = self.bytes[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    pub fn get_u64_vec(&mut self) -> Result<Vec<u64>> {
        let len = self.get_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            values.push(self.get_u64()?);
        }
        Ok(values)
    }

    pub fn get_string_vec(&mut self) -> Result<Vec<String>> {
        let len = self.get_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            values.push(self.get_string()?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut buffer = ByteBuffer::new();
        buffer.put_u8(0xAB);
        buffer.put_u32(0xDEAD_BEEF);
        buffer.put_u64(0x0123_4567_89AB_CDEF);
        buffer.put_i32(-2005);
        buffer.put_bool(true);

        assert_eq!(buffer.get_u8().unwrap(), 0xAB);
        assert_eq!(buffer.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(buffer.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(buffer.get_i32().unwrap(), -2005);
        assert!(buffer.get_bool().unwrap());
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_network_byte_order() {
        let mut buffer = ByteBuffer::new();
        buffer.put_u32(0x0102_0304);
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_sequences() {
        let mut buffer = ByteBuffer::new();
        buffer.put_string("dcl.nodes");
        buffer.put_u64_vec(&[1, 2, 3]);
        buffer.put_string_vec(&["a".to_string(), "b".to_string()]);
        buffer.put_bytes(&[9, 9, 9]);

        assert_eq!(buffer.get_string().unwrap(), "dcl.nodes");
        assert_eq!(buffer.get_u64_vec().unwrap(), vec![1, 2, 3]);
        assert_eq!(buffer.get_string_vec().unwrap(), vec!["a", "b"]);
        assert_eq!(buffer.get_byte_vec().unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut buffer = ByteBuffer::from_bytes(vec![0, 0]);
        assert!(buffer.get_u64().is_err());
        let mut buffer = ByteBuffer::from_bytes(vec![0, 0, 0, 10, 1]);
        assert!(buffer.get_byte_vec().is_err());
    }
}
