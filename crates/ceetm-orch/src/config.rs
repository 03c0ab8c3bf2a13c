//! Policy file loading and the static port map.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ceetm_qman::DomainId;
use serde::{Deserialize, Serialize};

use crate::binder::PortLocation;
use crate::orch::{CeetmOrchConfig, CeetmOrchError, CeetmOrchResult, PolicyTree, PortResolver};

/// Queue-manager placement of one device as written in the policy file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub domain: DomainId,
    pub subportal: u8,
    pub link: u8,
    /// Falls back to the orchestrator's `default_mtu`.
    #[serde(default)]
    pub mtu: Option<u16>,
}

impl PortEntry {
    pub fn location(&self, default_mtu: u16) -> PortLocation {
        PortLocation {
            domain: self.domain,
            subportal: self.subportal,
            link: self.link,
            mtu: self.mtu.unwrap_or(default_mtu),
        }
    }
}

/// Everything `ceetmd` needs to bring up shaping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub orch: CeetmOrchConfig,
    #[serde(default)]
    pub ports: HashMap<String, PortEntry>,
    #[serde(default)]
    pub devices: Vec<PolicyTree>,
}

impl PolicyFile {
    /// Port map built from `ports`, with the configured default MTU applied.
    pub fn port_map(&self) -> StaticPortMap {
        self.ports
            .iter()
            .fold(StaticPortMap::new(), |map, (device, entry)| {
                map.with_port(device.clone(), entry.location(self.orch.default_mtu))
            })
    }
}

/// Loads a policy file. `.json` files are read as JSON, anything else as YAML.
pub fn load_policy(path: impl AsRef<Path>) -> CeetmOrchResult<PolicyFile> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        CeetmOrchError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        CeetmOrchError::Config(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Device naming service backed by a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticPortMap {
    ports: HashMap<String, PortLocation>,
}

impl StaticPortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, device: impl Into<String>, location: PortLocation) -> Self {
        self.insert(device, location);
        self
    }

    pub fn insert(&mut self, device: impl Into<String>, location: PortLocation) {
        self.ports.insert(device.into(), location);
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl PortResolver for StaticPortMap {
    fn resolve(&self, device: &str) -> Option<PortLocation> {
        self.ports.get(device).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::NodeId;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const POLICY_YAML: &str = r#"
orch:
  default_mtu: 9000
  congestion:
    mode: frame_count
    enter: 128
    exit: 16
ports:
  eth0: { domain: 0, subportal: 0, link: 0 }
  eth1: { domain: 1, subportal: 2, link: 3, mtu: 1500 }
devices:
  - device: eth0
    handle: 1
    shaper: { rate_bps: 1000000000, ceil_bps: 1000000000, overhead: 24 }
    filters:
      - { pref: 1, handle: 1, class: "1:1" }
    channels:
      - minor: 1
        weight: 1
        prio:
          handle: 2
          wbfs:
            - { handle: 3, parent: 2, queues: 8, weights: [1, 1, 1, 1, 1, 1, 1, 1] }
"#;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_policy() {
        let file = write_temp(".yaml", POLICY_YAML);
        let policy = load_policy(file.path()).unwrap();

        assert_eq!(policy.orch.default_mtu, 9000);
        assert_eq!(policy.orch.congestion.enter, 128);
        assert_eq!(policy.orch.context_a, 0x1a00000080000000);
        assert_eq!(policy.devices.len(), 1);

        let device = &policy.devices[0];
        assert_eq!(device.root_id(), NodeId::new(1, 0));
        assert_eq!(device.filters[0].class, NodeId::new(1, 1));
        let prio = device.channels[0].prio.as_ref().unwrap();
        assert_eq!(prio.leaves.len(), 8);
        assert_eq!(prio.wbfs[0].queues, 8);
        assert!(prio.wbfs[0].eligibility.cr);
    }

    #[test]
    fn test_port_map_applies_default_mtu() {
        let file = write_temp(".yml", POLICY_YAML);
        let map = load_policy(file.path()).unwrap().port_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve("eth0").map(|p| p.mtu), Some(9000));
        assert_eq!(
            map.resolve("eth1"),
            Some(PortLocation {
                domain: DomainId(1),
                subportal: 2,
                link: 3,
                mtu: 1500
            })
        );
        assert_eq!(map.resolve("eth2"), None);
    }

    #[test]
    fn test_load_json_policy() {
        let json = r#"{
            "ports": { "eth0": { "domain": 0, "subportal": 1, "link": 1 } },
            "devices": [ { "device": "eth0", "handle": 16 } ]
        }"#;
        let file = write_temp(".json", json);
        let policy = load_policy(file.path()).unwrap();
        assert_eq!(policy.orch, CeetmOrchConfig::default());
        assert_eq!(policy.devices[0].handle, 16);
        assert!(policy.devices[0].shaper.is_none());
        assert!(policy.devices[0].channels.is_empty());
    }

    #[test]
    fn test_load_errors() {
        let missing = load_policy("/nonexistent/ceetm.yaml").unwrap_err();
        assert!(matches!(missing, CeetmOrchError::Config(_)));

        let file = write_temp(".yaml", "devices: [ { handle: 1 } ]");
        let bad = load_policy(file.path()).unwrap_err();
        assert!(bad.to_string().contains("failed to parse"));
    }
}
