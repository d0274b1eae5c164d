//! VDI configuration vocabulary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{LEAFCLSC_DISABLED, LEAFCLSC_FORCE, LEAFCLSC_OFFLINE};

/// Which of the two per-VDI config maps a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigNamespace {
    /// Storage-manager private keys (`vhd-parent`, `vdi_type`, `vhd-blocks`).
    Internal,
    /// User-visible keys (`leaf-coalesce`).
    Other,
}

impl ConfigNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigNamespace::Internal => "sm-config",
            ConfigNamespace::Other => "other-config",
        }
    }
}

/// Persisted configuration of one VDI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiConfig {
    #[serde(default)]
    pub internal: BTreeMap<String, String>,
    #[serde(default)]
    pub other: BTreeMap<String, String>,
}

impl VdiConfig {
    pub fn map(&self, ns: ConfigNamespace) -> &BTreeMap<String, String> {
        match ns {
            ConfigNamespace::Internal => &self.internal,
            ConfigNamespace::Other => &self.other,
        }
    }

    pub fn map_mut(&mut self, ns: ConfigNamespace) -> &mut BTreeMap<String, String> {
        match ns {
            ConfigNamespace::Internal => &mut self.internal,
            ConfigNamespace::Other => &mut self.other,
        }
    }

    pub fn get(&self, ns: ConfigNamespace, key: &str) -> Option<&str> {
        self.map(ns).get(key).map(String::as_str)
    }

    pub fn set(&mut self, ns: ConfigNamespace, key: &str, value: &str) {
        self.map_mut(ns).insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, ns: ConfigNamespace, key: &str) -> Option<String> {
        self.map_mut(ns).remove(key)
    }
}

/// Per-VDI leaf-coalesce policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafCoalescePolicy {
    /// No explicit policy.
    #[default]
    Default,
    Disabled,
    /// Live leaf-coalesce regardless of size, without a timeout.
    Force,
    /// The VDI needs to be offline to be leaf-coalesced.
    Offline,
}

impl LeafCoalescePolicy {
    /// Parse the stored value; unknown values count as no policy.
    pub fn from_config(value: Option<&str>) -> Self {
        match value {
            Some(LEAFCLSC_DISABLED) => LeafCoalescePolicy::Disabled,
            Some(LEAFCLSC_FORCE) => LeafCoalescePolicy::Force,
            Some(LEAFCLSC_OFFLINE) => LeafCoalescePolicy::Offline,
            _ => LeafCoalescePolicy::Default,
        }
    }

    pub fn as_config(&self) -> Option<&'static str> {
        match self {
            LeafCoalescePolicy::Default => None,
            LeafCoalescePolicy::Disabled => Some(LEAFCLSC_DISABLED),
            LeafCoalescePolicy::Force => Some(LEAFCLSC_FORCE),
            LeafCoalescePolicy::Offline => Some(LEAFCLSC_OFFLINE),
        }
    }
}

/// On-volume format of a VDI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VdiType {
    Vhd,
    /// Plain allocated volume without VHD metadata.
    Raw,
}

impl VdiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdiType::Vhd => "vhd",
            VdiType::Raw => "aio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_namespaces_are_separate() {
        let mut cfg = VdiConfig::default();
        cfg.set(ConfigNamespace::Internal, "vhd-parent", "p1");
        cfg.set(ConfigNamespace::Other, "leaf-coalesce", "force");
        assert_eq!(cfg.get(ConfigNamespace::Internal, "vhd-parent"), Some("p1"));
        assert_eq!(cfg.get(ConfigNamespace::Other, "vhd-parent"), None);
        assert_eq!(cfg.remove(ConfigNamespace::Other, "leaf-coalesce").as_deref(), Some("force"));
        assert!(cfg.other.is_empty());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(LeafCoalescePolicy::from_config(None), LeafCoalescePolicy::Default);
        assert_eq!(LeafCoalescePolicy::from_config(Some("false")), LeafCoalescePolicy::Disabled);
        assert_eq!(LeafCoalescePolicy::from_config(Some("force")), LeafCoalescePolicy::Force);
        assert_eq!(LeafCoalescePolicy::from_config(Some("offline")), LeafCoalescePolicy::Offline);
        assert_eq!(LeafCoalescePolicy::from_config(Some("bogus")), LeafCoalescePolicy::Default);
        assert_eq!(LeafCoalescePolicy::Offline.as_config(), Some("offline"));
    }
}
