//! ATSC channel model and channels.conf catalog.

mod conf;

pub use conf::{parse_channels_conf, ChannelMap, ConfError};

/// Modulation scheme for an over-the-air ATSC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    /// 8-level vestigial sideband (terrestrial broadcast).
    Vsb8,
    /// 64-QAM (cable).
    Qam64,
    /// 256-QAM (cable).
    Qam256,
}

impl Modulation {
    /// Parse the channels.conf spelling of a modulation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "8VSB" => Some(Modulation::Vsb8),
            "QAM_64" | "QAM64" => Some(Modulation::Qam64),
            "QAM_256" | "QAM256" => Some(Modulation::Qam256),
            _ => None,
        }
    }

    /// Value for the dvbsrc "modulation" property.
    pub fn as_dvb_str(&self) -> &'static str {
        match self {
            Modulation::Vsb8 => "8vsb",
            Modulation::Qam64 => "qam-64",
            Modulation::Qam256 => "qam-256",
        }
    }
}

/// A single tunable ATSC channel.
///
/// Channels are immutable once loaded; the catalog preserves the order they
/// appear in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub frequency_hz: u32,
    pub modulation: Modulation,
    pub video_pid: u16,
    pub audio_pid: u16,
    pub program_id: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulation_parse() {
        assert_eq!(Modulation::parse("8VSB"), Some(Modulation::Vsb8));
        assert_eq!(Modulation::parse("QAM_64"), Some(Modulation::Qam64));
        assert_eq!(Modulation::parse("QAM256"), Some(Modulation::Qam256));
        assert_eq!(Modulation::parse("16VSB"), None);
        assert_eq!(Modulation::parse(""), None);
    }
}
