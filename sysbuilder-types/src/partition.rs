//! Partition table types, type codes and partition bounds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PartitionTableType {
    /// GPT (GUID Partition Table), written with `sgdisk`
    Gpt,
}

impl PartitionTableType {
    /// Name as reported by `lsblk` in the `pttype` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpt" => Ok(Self::Gpt),
            _ => Err(ParseError::PartitionTable(s.to_string())),
        }
    }
}

impl fmt::Display for PartitionTableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PartitionTableType {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionTableType> for String {
    fn from(value: PartitionTableType) -> Self {
        value.as_str().to_string()
    }
}

/// A 4-digit hexadecimal partition type code as listed by `sgdisk -L`.
///
/// Stored upper-case so `ef00` and `EF00` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeCode(String);

impl TypeCode {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let trimmed = s.trim();
        if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::TypeCode(s.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TypeCode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TypeCode {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TypeCode> for String {
    fn from(value: TypeCode) -> Self {
        value.0
    }
}

/// Binary size suffixes understood by `sgdisk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Kibi,
    Mebi,
    Gibi,
    Tebi,
    Pebi,
}

impl SizeUnit {
    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'K' => Some(Self::Kibi),
            'M' => Some(Self::Mebi),
            'G' => Some(Self::Gibi),
            'T' => Some(Self::Tebi),
            'P' => Some(Self::Pebi),
            _ => None,
        }
    }

    pub fn suffix(&self) -> char {
        match self {
            Self::Kibi => 'K',
            Self::Mebi => 'M',
            Self::Gibi => 'G',
            Self::Tebi => 'T',
            Self::Pebi => 'P',
        }
    }

    pub fn multiplier(&self) -> u64 {
        match self {
            Self::Kibi => 1 << 10,
            Self::Mebi => 1 << 20,
            Self::Gibi => 1 << 30,
            Self::Tebi => 1 << 40,
            Self::Pebi => 1 << 50,
        }
    }
}

/// A sector count (no unit) or a byte size with a binary suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Amount {
    pub value: u64,
    pub unit: Option<SizeUnit>,
}

impl Amount {
    fn parse(s: &str) -> Option<Self> {
        let (digits, unit) = match s.chars().last()? {
            c if c.is_ascii_alphabetic() => (&s[..s.len() - 1], Some(SizeUnit::from_char(c)?)),
            _ => (s, None),
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let value: u64 = digits.parse().ok()?;
        if let Some(unit) = unit {
            value.checked_mul(unit.multiplier())?;
        }
        Some(Self { value, unit })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{}{}", self.value, unit.suffix()),
            None => write!(f, "{}", self.value),
        }
    }
}

/// Start or end position of a partition, in `sgdisk --new` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionBound {
    /// Empty string: next available sector (start) or largest block (end).
    Next,
    /// An absolute sector or byte position.
    Absolute(Amount),
    /// `+N`: relative to the next available start, or to this partition's start.
    AfterStart(Amount),
    /// `-N`: measured back from the end of the available space.
    BeforeEnd(Amount),
}

impl PartitionBound {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let trimmed = s.trim();
        let invalid = || ParseError::Bound(s.to_string());

        if trimmed.is_empty() {
            return Ok(Self::Next);
        }

        if let Some(rest) = trimmed.strip_prefix('+') {
            return Amount::parse(rest).map(Self::AfterStart).ok_or_else(invalid);
        }

        if let Some(rest) = trimmed.strip_prefix('-') {
            return Amount::parse(rest).map(Self::BeforeEnd).ok_or_else(invalid);
        }

        Amount::parse(trimmed).map(Self::Absolute).ok_or_else(invalid)
    }
}

impl fmt::Display for PartitionBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next => Ok(()),
            Self::Absolute(amount) => write!(f, "{amount}"),
            Self::AfterStart(amount) => write!(f, "+{amount}"),
            Self::BeforeEnd(amount) => write!(f, "-{amount}"),
        }
    }
}

impl FromStr for PartitionBound {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_render_back_in_sgdisk_notation() {
        for raw in ["", "2048", "+100M", "-2G", "1T", "+512k"] {
            let bound = PartitionBound::parse(raw).unwrap();
            assert_eq!(bound.to_string(), raw.to_uppercase());
        }
    }

    #[test]
    fn relative_bounds_keep_their_anchor() {
        assert_eq!(
            PartitionBound::parse("+4G").unwrap(),
            PartitionBound::AfterStart(Amount {
                value: 4,
                unit: Some(SizeUnit::Gibi)
            })
        );
        assert!(matches!(
            PartitionBound::parse("-1M").unwrap(),
            PartitionBound::BeforeEnd(_)
        ));
    }

    #[test]
    fn rejects_unparsable_bounds() {
        for bad in ["+", "-", "abc", "+10Q", "1.5G", "++1M", "+1M2"] {
            assert_eq!(
                PartitionBound::parse(bad),
                Err(ParseError::Bound(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn sized_bounds_that_overflow_are_rejected() {
        assert!(PartitionBound::parse("+18446744073709551615").is_ok());
        assert_eq!(
            PartitionBound::parse("+18446744073709551615K"),
            Err(ParseError::Bound("+18446744073709551615K".to_string()))
        );
    }

    #[test]
    fn type_codes_are_normalized() {
        assert_eq!(TypeCode::parse("ef00").unwrap(), TypeCode::parse("EF00").unwrap());
        assert!(TypeCode::parse("ef0").is_err());
        assert!(TypeCode::parse("zz00").is_err());
    }

    #[test]
    fn only_gpt_tables_are_supported() {
        assert_eq!(PartitionTableType::parse("GPT").unwrap(), PartitionTableType::Gpt);
        assert!(PartitionTableType::parse("dos").is_err());
    }
}
