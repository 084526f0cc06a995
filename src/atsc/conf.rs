//! channels.conf parsing and the channel catalog.
//!
//! The file format is the azap subset of channels.conf: one channel per
//! non-empty, non-comment line, with `:`-delimited fields
//! `NAME:FREQUENCY:MODULATION:VIDEO_PID:AUDIO_PID:PROGRAM_ID`.

use super::{Channel, Modulation};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Error raised while loading a channels.conf file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfError {
    /// A line could not be parsed. Lines are numbered from 1.
    Syntax { line: usize, message: String },
    /// Two channels share a name.
    DuplicateChannel { line: usize, name: String },
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfError::Syntax { line, message } => {
                write!(f, "channels.conf line {}: {}", line, message)
            }
            ConfError::DuplicateChannel { line, name } => {
                write!(f, "channels.conf line {}: duplicate channel {:?}", line, name)
            }
        }
    }
}

impl Error for ConfError {}

/// Read-only channel catalog, ordered as the source file.
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: Vec<Channel>,
    by_name: HashMap<String, usize>,
}

impl ChannelMap {
    /// Look up a channel by name.
    pub fn lookup(&self, name: &str) -> Option<&Channel> {
        self.by_name.get(name).map(|&i| &self.channels[i])
    }

    /// Channel names in catalog order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn insert(&mut self, channel: Channel, line: usize) -> Result<(), ConfError> {
        if self.by_name.contains_key(&channel.name) {
            return Err(ConfError::DuplicateChannel {
                line,
                name: channel.name,
            });
        }
        self.by_name.insert(channel.name.clone(), self.channels.len());
        self.channels.push(channel);
        Ok(())
    }
}

/// Parse a channels.conf document into a catalog.
///
/// Blank lines and `#` comments are skipped. Any malformed line aborts the
/// whole load.
pub fn parse_channels_conf(input: &str) -> Result<ChannelMap, ConfError> {
    let mut map = ChannelMap::default();
    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        map.insert(parse_line(trimmed, line)?, line)?;
    }
    Ok(map)
}

fn parse_line(text: &str, line: usize) -> Result<Channel, ConfError> {
    let syntax = |message: String| ConfError::Syntax { line, message };

    let fields: Vec<&str> = text.split(':').collect();
    if fields.len() != 6 {
        return Err(syntax(format!("expected 6 fields, found {}", fields.len())));
    }

    let name = fields[0];
    if name.is_empty() {
        return Err(syntax("empty channel name".to_string()));
    }

    let frequency_hz = fields[1]
        .parse::<u32>()
        .map_err(|_| syntax(format!("invalid frequency {:?}", fields[1])))?;
    let modulation = Modulation::parse(fields[2])
        .ok_or_else(|| syntax(format!("unknown modulation {:?}", fields[2])))?;
    let video_pid = parse_pid(fields[3]).map_err(&syntax)?;
    let audio_pid = parse_pid(fields[4]).map_err(&syntax)?;
    let program_id = fields[5]
        .parse::<u16>()
        .map_err(|_| syntax(format!("invalid program id {:?}", fields[5])))?;

    Ok(Channel {
        name: name.to_string(),
        frequency_hz,
        modulation,
        video_pid,
        audio_pid,
        program_id,
    })
}

fn parse_pid(field: &str) -> Result<u16, String> {
    field
        .parse::<u16>()
        .map_err(|_| format!("invalid PID {:?}", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Scanned with dvbv5-scan
ABC:189028615:8VSB:49:52:3

NBC:503028615:8VSB:65:68:1
";

    #[test]
    fn test_parse_preserves_order() {
        let map = parse_channels_conf(SAMPLE).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["ABC", "NBC"]);
    }

    #[test]
    fn test_lookup() {
        let map = parse_channels_conf(SAMPLE).unwrap();
        let abc = map.lookup("ABC").unwrap();
        assert_eq!(abc.frequency_hz, 189_028_615);
        assert_eq!(abc.modulation, Modulation::Vsb8);
        assert_eq!(abc.video_pid, 49);
        assert_eq!(abc.audio_pid, 52);
        assert_eq!(abc.program_id, 3);
        assert!(map.lookup("XYZ").is_none());
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let map = parse_channels_conf("\n# only comments\n\n").unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let input = "ABC:189028615:8VSB:49:52:3\nABC:503028615:8VSB:65:68:1\n";
        let err = parse_channels_conf(input).unwrap_err();
        assert_eq!(
            err,
            ConfError::DuplicateChannel {
                line: 2,
                name: "ABC".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_line_aborts() {
        let cases = [
            "ABC:189028615:8VSB:49:52",          // too few fields
            "ABC:189028615:8VSB:49:52:3:extra",  // too many fields
            ":189028615:8VSB:49:52:3",           // empty name
            "ABC:not-a-number:8VSB:49:52:3",     // bad frequency
            "ABC:189028615:COFDM:49:52:3",       // unsupported modulation
            "ABC:189028615:8VSB:49:52:70000",    // program id out of range
        ];
        for input in cases {
            assert!(
                matches!(parse_channels_conf(input), Err(ConfError::Syntax { line: 1, .. })),
                "expected syntax error for {:?}",
                input
            );
        }
    }
}
