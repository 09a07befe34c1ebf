//! Configuration settings for Snappatch

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration settings for patching a snapshot
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// The patcher configuration settings
    #[serde(default)]
    pub patcher: Patcher,

    /// The redqueen work directory configuration settings
    #[serde(default)]
    pub workdir: Workdir,
}

/// Configuration settings specific to the patch engine
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Patcher {
    /// Bitness used to decode guest instructions (16, 32 or 64)
    #[serde(default = "default_bitness")]
    pub bitness: u32,

    /// Log a warning when a patch address does not hold a `cmp` or `test`
    #[serde(default = "default_warn_non_compare")]
    pub warn_non_compare: bool,
}

/// Configuration settings for locating the redqueen work directory
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Workdir {
    /// Directory containing every `redqueen_workdir_<id>`
    #[serde(default = "default_workdir_base")]
    pub base: PathBuf,

    /// Id of the work directory used by this fuzzing instance
    #[serde(default)]
    pub id: u32,
}

const fn default_bitness() -> u32 {
    64
}

const fn default_warn_non_compare() -> bool {
    true
}

fn default_workdir_base() -> PathBuf {
    PathBuf::from("/tmp")
}

impl std::default::Default for Patcher {
    fn default() -> Self {
        Self {
            bitness: default_bitness(),
            warn_non_compare: default_warn_non_compare(),
        }
    }
}

impl std::default::Default for Workdir {
    fn default() -> Self {
        Self {
            base: default_workdir_base(),
            id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.patcher.bitness, 64);
        assert_eq!(config.workdir.base, PathBuf::from("/tmp"));
    }

    #[test]
    fn partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [patcher]
            bitness = 32

            [workdir]
            id = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.patcher.bitness, 32);
        assert!(config.patcher.warn_non_compare);
        assert_eq!(config.workdir.id, 3);
        assert_eq!(config.workdir.base, PathBuf::from("/tmp"));
    }
}
