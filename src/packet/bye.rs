//! Goodbye (PT 203)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::check_count;
use crate::error::CodecError;

/// Sources leaving the session, with an optional reason
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bye {
    ssrcs: Vec<u32>,
    reason: Option<String>,
}

impl Bye {
    pub fn new(ssrcs: Vec<u32>) -> Result<Self, CodecError> {
        check_count("BYE source count", ssrcs.len())?;
        Ok(Self {
            ssrcs,
            reason: None,
        })
    }

    pub fn ssrcs(&self) -> &[u32] {
        &self.ssrcs
    }

    pub fn add_ssrc(&mut self, ssrc: u32) -> Result<(), CodecError> {
        check_count("BYE source count", self.ssrcs.len() + 1)?;
        self.ssrcs.push(ssrc);
        Ok(())
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Set the reason for leaving; at most 255 bytes of UTF-8
    pub fn set_reason(&mut self, reason: impl Into<String>) -> Result<(), CodecError> {
        let reason = reason.into();
        if reason.len() > u8::MAX as usize {
            return Err(CodecError::OutOfRange {
                field: "BYE reason length",
                value: reason.len(),
                max: u8::MAX as usize,
            });
        }
        self.reason = Some(reason);
        Ok(())
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Result<Self, CodecError> {
        self.set_reason(reason)?;
        Ok(self)
    }

    fn reason_len(&self) -> usize {
        self.reason
            .as_ref()
            .map(|r| (1 + r.len() + 3) / 4 * 4)
            .unwrap_or(0)
    }

    pub(crate) fn body_len(&self) -> usize {
        self.ssrcs.len() * 4 + self.reason_len()
    }

    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        for ssrc in &self.ssrcs {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = &self.reason {
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason.as_bytes());
            buf.put_bytes(0, self.reason_len() - 1 - reason.len());
        }
    }

    pub(crate) fn decode(count: u8, buf: &mut Bytes) -> Result<Self, CodecError> {
        let needed = count as usize * 4;
        if buf.remaining() < needed {
            return Err(CodecError::TooShort {
                needed,
                actual: buf.remaining(),
            });
        }
        let ssrcs = (0..count).map(|_| buf.get_u32()).collect();

        let reason = if buf.has_remaining() {
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(CodecError::Truncated { what: "BYE reason" });
            }
            let raw = buf.split_to(len);
            let reason = String::from_utf8(raw.to_vec())
                .map_err(|_| CodecError::InvalidUtf8 { field: "BYE reason" })?;
            // null octets aligning the reason
            buf.advance(buf.remaining());
            Some(reason)
        } else {
            None
        };

        Ok(Self { ssrcs, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ControlPacket;

    #[test]
    fn test_reason_is_word_aligned() {
        let bye = Bye::new(vec![1]).unwrap().with_reason("bye").unwrap();
        // header 4 + ssrc 4 + len byte + "bye" = 12, already aligned
        assert_eq!(ControlPacket::from(bye).encoded_len(), 12);

        let bye = Bye::new(vec![1]).unwrap().with_reason("later").unwrap();
        let encoded = ControlPacket::from(bye.clone()).encode();
        assert_eq!(encoded.len(), 16);
        assert_eq!(&encoded[8..14], b"\x05later");
        assert_eq!(&encoded[14..], &[0, 0]);

        let mut buf = encoded;
        assert_eq!(ControlPacket::decode(&mut buf).unwrap(), ControlPacket::Bye(bye));
    }

    #[test]
    fn test_without_reason() {
        let bye = Bye::new(vec![5, 6, 7]).unwrap();
        let mut encoded = ControlPacket::from(bye.clone()).encode();
        assert_eq!(encoded[0] & 0x1f, 3);
        match ControlPacket::decode(&mut encoded).unwrap() {
            ControlPacket::Bye(decoded) => {
                assert_eq!(decoded, bye);
                assert!(decoded.reason().is_none());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_reason_too_long() {
        let mut bye = Bye::default();
        assert!(bye.set_reason("r".repeat(256)).is_err());
        assert!(bye.reason().is_none());
        assert!(bye.set_reason("r".repeat(255)).is_ok());
    }

    #[test]
    fn test_source_limit() {
        assert!(Bye::new((0..32).collect()).is_err());
        let mut bye = Bye::new((0..31).collect()).unwrap();
        assert!(bye.add_ssrc(31).is_err());
    }
}
