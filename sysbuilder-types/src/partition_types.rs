//! GPT type code catalog
//!
//! Maps `sgdisk` short codes to the partition type GUIDs that `lsblk`
//! reports, so a probed partition can be compared against its layout entry.

use serde::Deserialize;

use crate::TypeCode;

const GPT_TOML: &str = include_str!("../resources/gpt_typecodes.toml");

/// One known GPT partition type.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PartitionTypeInfo {
    /// `sgdisk` short code, e.g. `EF00`
    pub code: String,
    /// Lower-case type GUID
    pub guid: String,
    /// Human-readable name
    pub name: String,
}

#[derive(Deserialize)]
struct PartitionTypeCatalog {
    types: Vec<PartitionTypeInfo>,
}

static GPT_TYPES: std::sync::LazyLock<Vec<PartitionTypeInfo>> = std::sync::LazyLock::new(|| {
    toml::from_str::<PartitionTypeCatalog>(GPT_TOML)
        .map(|catalog| catalog.types)
        .unwrap_or_default()
});

pub fn find_by_guid(guid: &str) -> Option<&'static PartitionTypeInfo> {
    GPT_TYPES.iter().find(|info| info.guid.eq_ignore_ascii_case(guid.trim()))
}

pub fn find_by_code(code: &TypeCode) -> Option<&'static PartitionTypeInfo> {
    GPT_TYPES.iter().find(|info| info.code == code.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_parses_and_codes_are_valid() {
        assert!(!GPT_TYPES.is_empty());
        for info in GPT_TYPES.iter() {
            assert!(TypeCode::parse(&info.code).is_ok(), "{}", info.code);
        }
    }

    #[test]
    fn guid_lookup_is_case_insensitive() {
        let info = find_by_guid("C12A7328-F81F-11D2-BA4B-00A0C93EC93B").unwrap();
        assert_eq!(info.code, "EF00");
        let swap = find_by_code(&TypeCode::parse("8200").unwrap()).unwrap();
        assert_eq!(swap.name, "Linux swap");
    }
}
