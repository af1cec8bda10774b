//! Text line codec for operation log entries.
//!
//! Every entry is one line, `<marker> <start-hex> <split-hex>\n`, where the
//! marker is `+` for a planned operation and `-` for a completed one. Keys are
//! written zero padded to the key space width; any hex length up to 32 digits
//! is accepted when reading.

use crate::{
    key::{parse_hex, KeySpace},
    oplog::{OpLogError, OpLogResult},
    plan::SplitOperation,
};

const ADD_MARKER: &str = "+";
const REMOVE_MARKER: &str = "-";

/// A single record of the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntry {
    /// The operation was planned.
    Add(SplitOperation),
    /// The operation finished; its daughters are online.
    Remove(SplitOperation),
}

impl LogEntry {
    /// Operation carried by the entry.
    pub fn operation(&self) -> SplitOperation {
        match self {
            LogEntry::Add(op) | LogEntry::Remove(op) => *op,
        }
    }

    /// Render the entry as a newline-terminated line.
    pub fn encode(&self, space: &KeySpace) -> String {
        let (marker, op) = match self {
            LogEntry::Add(op) => (ADD_MARKER, op),
            LogEntry::Remove(op) => (REMOVE_MARKER, op),
        };
        format!(
            "{} {} {}\n",
            marker,
            space.to_hex(op.start),
            space.to_hex(op.split_point)
        )
    }

    /// Parse a line without its terminator.
    ///
    /// On failure returns the reason the line was rejected.
    pub fn decode(line: &str) -> Result<LogEntry, String> {
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 3 {
            return Err(format!("expected 3 tokens, found {}", tokens.len()));
        }
        let start = parse_hex(tokens[1]).map_err(|err| err.to_string())?;
        let split_point = parse_hex(tokens[2]).map_err(|err| err.to_string())?;
        if start >= split_point {
            return Err(format!(
                "start {:x} is not below split point {:x}",
                start, split_point
            ));
        }
        let op = SplitOperation { start, split_point };
        match tokens[0] {
            ADD_MARKER => Ok(LogEntry::Add(op)),
            REMOVE_MARKER => Ok(LogEntry::Remove(op)),
            other => Err(format!("unknown marker {other:?}")),
        }
    }
}

/// Entries decoded from a whole log image.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodedLog {
    /// Entries in file order.
    pub entries: Vec<LogEntry>,
    /// Length of the newline-terminated prefix when an unterminated final
    /// line was dropped.
    pub torn_tail: Option<usize>,
}

/// Encode a batch of entries into one buffer.
pub fn encode_entries<'a>(
    space: &KeySpace,
    entries: impl IntoIterator<Item = &'a LogEntry>,
) -> Vec<u8> {
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&entry.encode(space));
    }
    buf.into_bytes()
}

/// Decode a full log image.
///
/// Every newline-terminated line must parse. The writer terminates every line
/// it appends, so a final line without a terminator is a write cut short by a
/// crash whatever its content: it is never parsed and its offset is reported
/// through [`DecodedLog::torn_tail`].
pub fn decode_log(data: &[u8]) -> OpLogResult<DecodedLog> {
    let mut decoded = DecodedLog::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < data.len() {
        line_no += 1;
        let Some(pos) = data[offset..].iter().position(|b| *b == b'\n') else {
            decoded.torn_tail = Some(offset);
            break;
        };
        let raw = &data[offset..offset + pos];

        let parsed = std::str::from_utf8(raw)
            .map_err(|_| "line is not valid utf-8".to_string())
            .and_then(LogEntry::decode);
        match parsed {
            Ok(entry) => decoded.entries.push(entry),
            Err(reason) => {
                return Err(OpLogError::Corruption {
                    line: line_no,
                    reason,
                });
            }
        }
        offset += pos + 1;
    }

    Ok(decoded)
}
