//! Target disk description

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ParseError, PartitionTableType, Size};

/// How the storage medium behind the image is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiskKind {
    /// Sparse backing file created with `truncate`; allocates on write.
    Sparse,
    /// Fully allocated backing file written with `dd`.
    Raw,
    /// An existing block device; nothing is created or loop-attached.
    Physical,
}

impl DiskKind {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sparse" => Ok(Self::Sparse),
            "raw" => Ok(Self::Raw),
            "physical" => Ok(Self::Physical),
            _ => Err(ParseError::DiskKind(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Raw => "raw",
            Self::Physical => "physical",
        }
    }

    /// Whether the core creates a backing file and loop-attaches it.
    pub fn is_virtual(&self) -> bool {
        !matches!(self, Self::Physical)
    }
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for DiskKind {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DiskKind> for String {
    fn from(value: DiskKind) -> Self {
        value.as_str().to_string()
    }
}

/// `storage.disk` from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Backing file for virtual disks, device node for physical ones.
    pub path: PathBuf,

    #[serde(rename = "type")]
    pub kind: DiskKind,

    /// Required for virtual disks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,

    pub ptable: PartitionTableType,
}
