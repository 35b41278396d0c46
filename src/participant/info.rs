//! Descriptive participant metadata

use rand::Rng;

use crate::packet::{SdesChunk, SdesItem};

/// SSRC plus whatever the participant announced about itself over SDES
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub ssrc: u32,
    pub cname: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
    pub priv_prefix: Option<String>,
    pub priv_value: Option<String>,
}

impl ParticipantInfo {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    /// Info with a freshly drawn SSRC
    pub fn random() -> Self {
        Self::new(Self::generate_ssrc())
    }

    /// Random SSRC in [0, 2^31 - 1)
    pub fn generate_ssrc() -> u32 {
        rand::thread_rng().gen_range(0..i32::MAX as u32)
    }

    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = Some(cname.into());
        self
    }

    /// Apply an SDES chunk. Only values that differ from the current ones
    /// count as a change; the SSRC follows the chunk.
    pub fn update_from_sdes_chunk(&mut self, chunk: &SdesChunk) -> bool {
        let mut modified = false;
        if self.ssrc != chunk.ssrc {
            self.ssrc = chunk.ssrc;
            modified = true;
        }

        for item in chunk.items() {
            modified |= match item {
                SdesItem::Cname(v) => replace_if_changed(&mut self.cname, v),
                SdesItem::Name(v) => replace_if_changed(&mut self.name, v),
                SdesItem::Email(v) => replace_if_changed(&mut self.email, v),
                SdesItem::Phone(v) => replace_if_changed(&mut self.phone, v),
                SdesItem::Location(v) => replace_if_changed(&mut self.location, v),
                SdesItem::Tool(v) => replace_if_changed(&mut self.tool, v),
                SdesItem::Note(v) => replace_if_changed(&mut self.note, v),
                SdesItem::Priv { prefix, value } => {
                    let changed = self.priv_prefix.as_deref() != Some(prefix.as_str())
                        || self.priv_value.as_deref() != Some(value.as_str());
                    if changed {
                        self.priv_prefix = Some(prefix.clone());
                        self.priv_value = Some(value.clone());
                    }
                    changed
                }
            };
        }
        modified
    }
}

fn replace_if_changed(slot: &mut Option<String>, value: &str) -> bool {
    if slot.as_deref() == Some(value) {
        return false;
    }
    *slot = Some(value.to_string());
    true
}

impl std::fmt::Display for ParticipantInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.ssrc)?;
        if let Some(cname) = &self.cname {
            write!(f, " ({})", cname)?;
        }
        Ok(())
    }
}
