//! Byte sizes as written in configuration files

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ParseError;

const UNITS: [(char, u32); 5] = [('K', 1), ('M', 2), ('G', 3), ('T', 4), ('P', 5)];

/// Parse a size such as `"32G"`, `"512M"`, `"1K"` or `"4096"` into bytes.
///
/// Suffixes are powers of 1024, matching `truncate` and `sgdisk`.
pub fn parse_size(input: &str) -> Result<u64, ParseError> {
    let trimmed = input.trim();
    let invalid = || ParseError::Size(input.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (digits, exponent) = match trimmed.chars().last() {
        Some(last) if last.is_ascii_alphabetic() => {
            let upper = last.to_ascii_uppercase();
            let (_, exponent) = UNITS
                .iter()
                .find(|(unit, _)| *unit == upper)
                .ok_or_else(invalid)?;
            (&trimmed[..trimmed.len() - 1], *exponent)
        }
        _ => (trimmed, 0),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value
        .checked_mul(1024_u64.pow(exponent))
        .ok_or_else(invalid)
}

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: u64) -> String {
    let mut steps = 0;
    let mut val = bytes as f64;

    while val >= 1024. && steps < 5 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KB",
        2 => "MB",
        3 => "GB",
        4 => "TB",
        _ => "PB",
    };

    format!("{:.2} {}", val, unit)
}

/// A byte count that deserializes from either an integer or a suffixed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size(u64);

impl Size {
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Size {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size(s).map(Self)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(Self(bytes)),
            Raw::Text(text) => parse_size(&text).map(Self).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes_as_powers_of_1024() {
        assert_eq!(parse_size("32G").unwrap(), 32 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("234m").unwrap(), 234 * 1024 * 1024);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage_sizes() {
        for bad in ["", "G", "12X", "1.5G", "-1G", "+4G"] {
            assert!(parse_size(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn size_accepts_integer_or_string_in_json() {
        let from_int: Size = serde_json::from_str("1048576").unwrap();
        let from_str: Size = serde_json::from_str("\"1M\"").unwrap();
        assert_eq!(from_int, from_str);
        assert!(serde_json::from_str::<Size>("\"lots\"").is_err());
    }

    #[test]
    fn pretty_prints_gibibytes() {
        assert_eq!(bytes_to_pretty(32 * 1024 * 1024 * 1024), "32.00 GB");
        assert_eq!(bytes_to_pretty(512), "512.00 B");
    }
}
