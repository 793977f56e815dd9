//! Partition layout entries

use serde::{Deserialize, Serialize};

use crate::{FilesystemSpec, ParseError, PartitionBound, TypeCode};

/// One desired partition, in the order it should appear on disk.
///
/// Bounds and type code are kept as written so the partitioner can report
/// the exact offending text; use the accessors to parse them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    #[serde(default)]
    pub start: String,

    #[serde(default)]
    pub end: String,

    pub typecode: String,

    pub filesystem: FilesystemSpec,
}

impl LayoutEntry {
    pub fn new(start: &str, end: &str, typecode: &str, filesystem: FilesystemSpec) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            typecode: typecode.to_string(),
            filesystem,
        }
    }

    pub fn start_bound(&self) -> Result<PartitionBound, ParseError> {
        PartitionBound::parse(&self.start)
    }

    pub fn end_bound(&self) -> Result<PartitionBound, ParseError> {
        PartitionBound::parse(&self.end)
    }

    pub fn type_code(&self) -> Result<TypeCode, ParseError> {
        TypeCode::parse(&self.typecode)
    }

    /// Parse every string field at once, returning the first failure.
    pub fn validate(&self) -> Result<(PartitionBound, PartitionBound, TypeCode), ParseError> {
        Ok((self.start_bound()?, self.end_bound()?, self.type_code()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilesystemKind, MountPoint};

    #[test]
    fn validate_reports_the_first_bad_field() {
        let fs = FilesystemSpec::new(FilesystemKind::Ext4, MountPoint::parse("/").unwrap());
        let good = LayoutEntry::new("", "+4G", "8300", fs.clone());
        assert!(good.validate().is_ok());

        let bad_end = LayoutEntry::new("", "four gigs", "8300", fs.clone());
        assert_eq!(
            bad_end.validate().unwrap_err(),
            ParseError::Bound("four gigs".to_string())
        );

        let bad_code = LayoutEntry::new("", "", "linux", fs);
        assert!(matches!(bad_code.validate(), Err(ParseError::TypeCode(_))));
    }
}
