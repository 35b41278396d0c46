//! H.264 RTP payload classification (RFC 6184)

/// NAL unit type of a single-time aggregation packet
pub const NAL_TYPE_STAP_A: u8 = 24;

/// NAL unit type of a fragmentation unit
pub const NAL_TYPE_FU_A: u8 = 28;

const FORBIDDEN_BIT: u8 = 0x80;
const NRI_MASK: u8 = 0x60;
const TYPE_MASK: u8 = 0x1F;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// How a payload carries NAL data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// One complete NAL unit (types 1-23)
    Full,
    /// FU-A piece of a larger NAL unit
    Fragment,
    /// STAP-A: length-prefixed NAL units
    Aggregate,
    Unknown,
}

/// Parsed payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    pub kind: NalKind,
    /// Type field of the first octet
    pub nal_type: u8,
    forbidden: u8,
    nri: u8,
    fu_start: bool,
    fu_end: bool,
    fu_type: u8,
}

impl NalHeader {
    /// Classify a payload. `None` when the payload is shorter than the header
    /// it claims to carry.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let first = *payload.first()?;
        let nal_type = first & TYPE_MASK;
        let kind = match nal_type {
            1..=23 => NalKind::Full,
            NAL_TYPE_STAP_A => NalKind::Aggregate,
            NAL_TYPE_FU_A => NalKind::Fragment,
            _ => NalKind::Unknown,
        };

        let mut header = Self {
            kind,
            nal_type,
            forbidden: first & FORBIDDEN_BIT,
            nri: first & NRI_MASK,
            fu_start: false,
            fu_end: false,
            fu_type: 0,
        };

        if kind == NalKind::Fragment {
            let fu = *payload.get(1)?;
            header.fu_start = fu & FU_START != 0;
            header.fu_end = fu & FU_END != 0;
            header.fu_type = fu & TYPE_MASK;
        }
        Some(header)
    }

    pub fn is_start(&self) -> bool {
        self.fu_start
    }

    pub fn is_end(&self) -> bool {
        self.fu_end
    }

    /// Header octet of the fragmented NAL unit: F and NRI from the FU
    /// indicator, type from the FU header
    pub fn reconstructed_header(&self) -> u8 {
        self.forbidden | self.nri | self.fu_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(NalHeader::parse(&[0x65, 0xAA]).unwrap().kind, NalKind::Full);
        assert_eq!(NalHeader::parse(&[0x41]).unwrap().kind, NalKind::Full);
        assert_eq!(NalHeader::parse(&[0x78, 0, 2]).unwrap().kind, NalKind::Aggregate);
        assert_eq!(NalHeader::parse(&[0x7C, 0x85]).unwrap().kind, NalKind::Fragment);
        assert_eq!(NalHeader::parse(&[0x00]).unwrap().kind, NalKind::Unknown);
        assert_eq!(NalHeader::parse(&[0x1D, 0x00]).unwrap().kind, NalKind::Unknown);
    }

    #[test]
    fn test_short_payloads() {
        assert!(NalHeader::parse(&[]).is_none());
        assert!(NalHeader::parse(&[0x7C]).is_none());
    }

    #[test]
    fn test_fragment_flags_and_header() {
        // FU indicator NRI=3, FU header start + IDR
        let start = NalHeader::parse(&[0x7C, 0x85, 0x00]).unwrap();
        assert!(start.is_start());
        assert!(!start.is_end());
        assert_eq!(start.reconstructed_header(), 0x65);

        let end = NalHeader::parse(&[0x5C, 0x41]).unwrap();
        assert!(end.is_end());
        assert_eq!(end.reconstructed_header(), 0x41);
    }

    #[test]
    fn test_non_fragments_carry_no_flags() {
        let full = NalHeader::parse(&[0x65, 0xC0]).unwrap();
        assert!(!full.is_start());
        assert!(!full.is_end());
    }
}
