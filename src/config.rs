use crate::errors::{BridgeError, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Refine proxy classes through their description text
    #[serde(default = "default_true")]
    pub proxy_disambiguation: bool,

    /// Report type fallbacks at WARN instead of DEBUG
    #[serde(default = "default_true")]
    pub warn_on_fallback: bool,

    /// Class used as the `isa` of packaged blocks
    #[serde(default = "default_global_block_class")]
    pub global_block_class: String,

    #[serde(default = "default_class_query")]
    pub class_query: String,

    #[serde(default = "default_description_query")]
    pub description_query: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            proxy_disambiguation: true,
            warn_on_fallback: true,
            global_block_class: default_global_block_class(),
            class_query: default_class_query(),
            description_query: default_description_query(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| {
            BridgeError::new(ErrorKind::Config {
                message: e.to_string(),
            })
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::new(ErrorKind::Config {
                message: format!("{}: {}", path.display(), e),
            })
        })?;
        Self::from_toml_str(&content)
    }

    /// Look for `nsbridge.toml` in `dir`, defaults when absent
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join("nsbridge.toml");
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            BridgeError::new(ErrorKind::Config {
                message: e.to_string(),
            })
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_global_block_class() -> String {
    "__NSConcreteGlobalBlock".to_string()
}

fn default_class_query() -> String {
    "class".to_string()
}

fn default_description_query() -> String {
    "description".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_for_missing_keys() {
        let config = BridgeConfig::from_toml_str("warn_on_fallback = false").unwrap();
        assert!(!config.warn_on_fallback);
        assert!(config.proxy_disambiguation);
        assert_eq!(config.global_block_class, "__NSConcreteGlobalBlock");
        assert_eq!(config.class_query, "class");
    }

    #[test]
    fn test_invalid_toml() {
        let err = BridgeConfig::from_toml_str("proxy_disambiguation = 3").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Config { .. }));
    }

    #[test]
    fn test_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BridgeConfig::discover(dir.path()).unwrap(), BridgeConfig::default());

        let mut file = fs::File::create(dir.path().join("nsbridge.toml")).unwrap();
        writeln!(file, "proxy_disambiguation = false").unwrap();
        writeln!(file, "description_query = \"debugDescription\"").unwrap();

        let config = BridgeConfig::discover(dir.path()).unwrap();
        assert!(!config.proxy_disambiguation);
        assert_eq!(config.description_query, "debugDescription");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let text = BridgeConfig::default().to_toml_string().unwrap();
        assert_eq!(BridgeConfig::from_toml_str(&text).unwrap(), BridgeConfig::default());
    }
}
