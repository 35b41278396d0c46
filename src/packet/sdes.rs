//! Source description (PT 202)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::check_count;
use crate::error::CodecError;

/// SDES item type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdesItemType {
    Null = 0,
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Location = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl TryFrom<u8> for SdesItemType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Cname),
            2 => Ok(Self::Name),
            3 => Ok(Self::Email),
            4 => Ok(Self::Phone),
            5 => Ok(Self::Location),
            6 => Ok(Self::Tool),
            7 => Ok(Self::Note),
            8 => Ok(Self::Priv),
            other => Err(CodecError::OutOfRange {
                field: "SDES item type",
                value: other as usize,
                max: 8,
            }),
        }
    }
}

/// One SDES item. Text is UTF-8 and at most 255 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdesItem {
    Cname(String),
    Name(String),
    Email(String),
    Phone(String),
    Location(String),
    Tool(String),
    Note(String),
    /// Private extension; prefix and value share the 255-byte budget
    /// together with the prefix length byte
    Priv { prefix: String, value: String },
}

impl SdesItem {
    pub fn item_type(&self) -> SdesItemType {
        match self {
            Self::Cname(_) => SdesItemType::Cname,
            Self::Name(_) => SdesItemType::Name,
            Self::Email(_) => SdesItemType::Email,
            Self::Phone(_) => SdesItemType::Phone,
            Self::Location(_) => SdesItemType::Location,
            Self::Tool(_) => SdesItemType::Tool,
            Self::Note(_) => SdesItemType::Note,
            Self::Priv { .. } => SdesItemType::Priv,
        }
    }

    /// Text value; for PRIV items this is the value without its prefix
    pub fn value(&self) -> &str {
        match self {
            Self::Cname(v)
            | Self::Name(v)
            | Self::Email(v)
            | Self::Phone(v)
            | Self::Location(v)
            | Self::Tool(v)
            | Self::Note(v) => v,
            Self::Priv { value, .. } => value,
        }
    }

    /// Length byte as written on the wire
    fn content_len(&self) -> usize {
        match self {
            Self::Priv { prefix, value } => 1 + prefix.len() + value.len(),
            other => other.value().len(),
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        let len = self.content_len();
        if len > u8::MAX as usize {
            return Err(CodecError::OutOfRange {
                field: "SDES item length",
                value: len,
                max: u8::MAX as usize,
            });
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        2 + self.content_len()
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.item_type() as u8);
        buf.put_u8(self.content_len() as u8);
        match self {
            Self::Priv { prefix, value } => {
                buf.put_u8(prefix.len() as u8);
                buf.put_slice(prefix.as_bytes());
                buf.put_slice(value.as_bytes());
            }
            other => buf.put_slice(other.value().as_bytes()),
        }
    }

    /// Read an item after its type byte. `Ok(None)` means an unknown type
    /// that was skipped.
    fn read(kind: u8, buf: &mut Bytes) -> Result<Option<Self>, CodecError> {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated { what: "SDES item length" });
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated { what: "SDES item" });
        }
        let mut content = buf.split_to(len);

        let kind = match SdesItemType::try_from(kind) {
            Ok(kind) => kind,
            Err(_) => {
                tracing::trace!("Skipping SDES item of unknown type {}", kind);
                return Ok(None);
            }
        };

        let item = match kind {
            SdesItemType::Priv => {
                if !content.has_remaining() {
                    return Err(CodecError::Truncated { what: "PRIV prefix length" });
                }
                let prefix_len = content.get_u8() as usize;
                if content.remaining() < prefix_len {
                    return Err(CodecError::Truncated { what: "PRIV prefix" });
                }
                let prefix = utf8(content.split_to(prefix_len), "PRIV prefix")?;
                let value = utf8(content, "PRIV value")?;
                Self::Priv { prefix, value }
            }
            SdesItemType::Cname => Self::Cname(utf8(content, "CNAME")?),
            SdesItemType::Name => Self::Name(utf8(content, "NAME")?),
            SdesItemType::Email => Self::Email(utf8(content, "EMAIL")?),
            SdesItemType::Phone => Self::Phone(utf8(content, "PHONE")?),
            SdesItemType::Location => Self::Location(utf8(content, "LOC")?),
            SdesItemType::Tool => Self::Tool(utf8(content, "TOOL")?),
            SdesItemType::Note => Self::Note(utf8(content, "NOTE")?),
            SdesItemType::Null => return Ok(None),
        };
        Ok(Some(item))
    }
}

fn utf8(bytes: Bytes, field: &'static str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}

/// Items describing one source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdesChunk {
    pub ssrc: u32,

    items: Vec<SdesItem>,
}

impl SdesChunk {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            items: Vec::new(),
        }
    }

    pub fn items(&self) -> &[SdesItem] {
        &self.items
    }

    /// Append an item after checking its length
    pub fn add_item(&mut self, item: SdesItem) -> Result<(), CodecError> {
        item.validate()?;
        self.items.push(item);
        Ok(())
    }

    /// First value of the given type
    pub fn value_of(&self, kind: SdesItemType) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.item_type() == kind)
            .map(SdesItem::value)
    }

    pub fn cname(&self) -> Option<&str> {
        self.value_of(SdesItemType::Cname)
    }

    /// ssrc + items + null item, rounded up to a 32-bit boundary
    fn encoded_len(&self) -> usize {
        let items: usize = self.items.iter().map(SdesItem::encoded_len).sum();
        4 + (items + 1 + 3) / 4 * 4
    }

    fn write(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(self.ssrc);
        for item in &self.items {
            item.write(buf);
        }
        let written = buf.len() - start;
        buf.put_bytes(0, self.encoded_len() - written);
    }

    fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated { what: "SDES chunk" });
        }
        let mut chunk = Self::new(buf.get_u32());
        let mut read = 0;

        loop {
            // Tolerate senders that omit the terminating null item
            if !buf.has_remaining() {
                return Ok(chunk);
            }

            let before = buf.remaining();
            let kind = buf.get_u8();
            if kind == SdesItemType::Null as u8 {
                read += 1;
                let padding = 4 - (read % 4);
                if padding != 4 {
                    buf.advance(padding.min(buf.remaining()));
                }
                return Ok(chunk);
            }

            let item = SdesItem::read(kind, buf)?;
            read += before - buf.remaining();
            if let Some(item) = item {
                chunk.items.push(item);
            }
        }
    }
}

/// SDES packet: one chunk per source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[SdesChunk] {
        &self.chunks
    }

    pub fn add_chunk(&mut self, chunk: SdesChunk) -> Result<(), CodecError> {
        check_count("SDES chunk count", self.chunks.len() + 1)?;
        self.chunks.push(chunk);
        Ok(())
    }

    pub(crate) fn body_len(&self) -> usize {
        self.chunks.iter().map(SdesChunk::encoded_len).sum()
    }

    pub(crate) fn write_body(&self, buf: &mut BytesMut) {
        for chunk in &self.chunks {
            chunk.write(buf);
        }
    }

    pub(crate) fn decode(count: u8, buf: &mut Bytes) -> Result<Self, CodecError> {
        let mut packet = Self::new();
        for _ in 0..count {
            packet.chunks.push(SdesChunk::read(buf)?);
        }
        Ok(packet)
    }
}
