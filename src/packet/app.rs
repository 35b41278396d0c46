//! Application-defined packet (PT 204)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_RTCP_COUNT;
use crate::error::CodecError;

/// APP packet. The subtype travels in the header count field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    subtype: u8,
    ssrc: u32,
    name: [u8; 4],
    data: Bytes,
}

impl AppData {
    /// `data` must be a whole number of 32-bit words
    pub fn new(
        subtype: u8,
        ssrc: u32,
        name: [u8; 4],
        data: impl Into<Bytes>,
    ) -> Result<Self, CodecError> {
        if subtype as usize > MAX_RTCP_COUNT {
            return Err(CodecError::OutOfRange {
                field: "APP subtype",
                value: subtype as usize,
                max: MAX_RTCP_COUNT,
            });
        }
        let data = data.into();
        if data.len() % 4 != 0 {
            return Err(CodecError::Misaligned {
                field: "APP data",
                value: data.len(),
            });
        }
        Ok(Self {
            subtype,
            ssrc,
            name,
            data,
        })
    }

    pub fn subtype(&self) -> u8 {
        self.subtype
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Four ASCII characters naming the application
    pub fn name(&self) -> &[u8; 4] {
        &self.name
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub(crate) fn body_len(&self) -> usize {
        8 + self.data.len()
    }

    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
    }

    pub(crate) fn decode(subtype: u8, buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining() < 8 {
            return Err(CodecError::TooShort {
                needed: 8,
                actual: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let mut name = [0u8; 4];
        buf.copy_to_slice(&mut name);
        let data = buf.split_to(buf.remaining() / 4 * 4);
        Ok(Self {
            subtype,
            ssrc,
            name,
            data,
        })
    }
}
