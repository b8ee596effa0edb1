//! Log sequence positions
//!
//! A [`LogPos`] is an absolute byte offset into the source write-ahead log.
//! PostgreSQL renders it as two hexadecimal halves separated by a slash,
//! e.g. `16/B374D848`. The upper half is printed without padding and the
//! lower half is always eight digits.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A position in the source write-ahead log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPos(pub u64);

impl LogPos {
    /// The zero position, which asks the server to start at the slot's
    /// confirmed flush position
    pub const ZERO: LogPos = LogPos(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        LogPos(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Render as `HIGH/LOW` in uppercase hexadecimal
    pub fn to_text(self) -> String {
        format!("{:X}/{:08X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }

    /// Parse the `HIGH/LOW` text form. Input is case-insensitive.
    pub fn parse_text(s: &str) -> Result<LogPos> {
        let mut parts = s.split('/');
        let (high, low) = match (parts.next(), parts.next(), parts.next()) {
            (Some(high), Some(low), None) => (high, low),
            (_, None, _) => return Err(CdcError::log_pos_format(s, "missing '/' separator")),
            _ => return Err(CdcError::log_pos_format(s, "more than one '/' separator")),
        };

        let high = parse_half(s, high)?;
        let low = parse_half(s, low)?;
        Ok(LogPos((u64::from(high) << 32) | u64::from(low)))
    }
}

fn parse_half(input: &str, half: &str) -> Result<u32> {
    if half.is_empty() {
        return Err(CdcError::log_pos_format(input, "empty hexadecimal component"));
    }
    // from_str_radix would also accept a leading '+'
    if !half.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CdcError::log_pos_format(
            input,
            format!("'{}' is not hexadecimal", half),
        ));
    }
    u32::from_str_radix(half, 16).map_err(|_| {
        CdcError::log_pos_format(input, format!("'{}' does not fit in 32 bits", half))
    })
}

impl fmt::Display for LogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for LogPos {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        LogPos::parse_text(s)
    }
}

impl From<u64> for LogPos {
    fn from(value: u64) -> Self {
        LogPos(value)
    }
}

impl From<LogPos> for u64 {
    fn from(pos: LogPos) -> Self {
        pos.0
    }
}

// Serialized in text form so checkpoint files stay readable next to
// pg_replication_slots output.
impl Serialize for LogPos {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for LogPos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        LogPos::parse_text(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_text() {
        assert_eq!(LogPos(607931488).to_text(), "0/243C4C60");
        assert_eq!(LogPos(692097666144).to_text(), "A1/243C4C60");
        assert_eq!(LogPos(0).to_text(), "0/00000000");
        assert_eq!(LogPos(u64::MAX).to_text(), "FFFFFFFF/FFFFFFFF");
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(LogPos::parse_text("0/243C4C60").unwrap(), LogPos(607931488));
        assert_eq!(
            LogPos::parse_text("A1/243C4C60").unwrap(),
            LogPos(692097666144)
        );
        assert_eq!(
            LogPos::parse_text("a1/243c4c60").unwrap(),
            LogPos(692097666144)
        );
        assert_eq!(LogPos::parse_text("0/0").unwrap(), LogPos::ZERO);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in [
            "",
            "243C4C60",
            "0/1/2",
            "/1",
            "1/",
            "0/XYZ",
            "+1/0",
            "0/-1",
            "100000000/0",
            "0/100000000",
            " 0/1",
        ] {
            let err = LogPos::parse_text(input).unwrap_err();
            assert!(
                matches!(err, CdcError::LogPosFormat { .. }),
                "expected format error for {:?}, got {:?}",
                input,
                err
            );
        }
    }

    #[test]
    fn test_round_trip_samples() {
        let samples = [
            0u64,
            1,
            0xFFFF_FFFF,
            0x1_0000_0000,
            0x16_B374_D848,
            u64::MAX - 1,
            u64::MAX,
        ];
        for value in samples {
            let pos = LogPos(value);
            assert_eq!(LogPos::parse_text(&pos.to_text()).unwrap(), pos);
        }
    }

    #[test]
    fn test_ordering_follows_integer_value() {
        let a: LogPos = "0/FFFFFFFF".parse().unwrap();
        let b: LogPos = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.value() - a.value(), 1);
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&LogPos(692097666144)).unwrap();
        assert_eq!(json, "\"A1/243C4C60\"");
        let back: LogPos = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogPos(692097666144));
        assert!(serde_json::from_str::<LogPos>("\"nope\"").is_err());
    }
}
