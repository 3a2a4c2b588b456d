//! Desired-configuration records.
//!
//! Per-service configuration lives in the dynamic store under
//! `setup/network/service/<serviceID>/ipv6`; this module defines the record
//! shape, the transient [`ServiceConfig`] used while reconciling, and the
//! optional JSON preferences file whose entries are seeded into the store at
//! startup.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::method::{Ipv4Primary, MethodData, RelayAddress, StaticAddress};
use crate::service::MethodId;
use crate::store::Store;

/// Store prefix for per-service desired configuration.
pub const SETUP_PREFIX: &str = "setup/network/service/";

/// Store key of the primary IPv4 service record.
pub const IPV4_PRIMARY_KEY: &str = "state/network/global/ipv4";

/// One service's desired configuration as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSetup {
    pub interface: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefix_lens: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
}

/// Transient description used only while reconciling desired against live
/// configuration; never retained afterwards.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub id: String,
    pub interface: String,
    pub method: MethodId,
    pub data: MethodData,
}

/// Default prefix length for manual addresses with none configured.
const DEFAULT_PREFIX_LEN: u8 = 64;

impl ServiceConfig {
    pub fn from_setup(id: &str, setup: &ServiceSetup) -> Result<Self, ConfigError> {
        let method: MethodId = setup
            .method
            .parse()
            .map_err(|_| ConfigError::OperationNotSupported(setup.method.clone()))?;

        let data = match method {
            MethodId::Manual => {
                let addresses = setup
                    .addresses
                    .iter()
                    .enumerate()
                    .map(|(i, addr)| StaticAddress {
                        addr: *addr,
                        prefix_len: setup
                            .prefix_lens
                            .get(i)
                            .copied()
                            .unwrap_or(DEFAULT_PREFIX_LEN),
                    })
                    .collect();
                MethodData::Manual { addresses }
            }
            MethodId::LinkLocal => {
                // Every interface gets its private link-local service; it is
                // not externally configurable.
                return Err(ConfigError::InvalidOperation(
                    "link-local is not a configurable method".to_string(),
                ));
            }
            MethodId::Automatic => MethodData::Automatic,
            MethodId::SixToFour => {
                let relay = setup.relay.as_deref().ok_or_else(|| {
                    ConfigError::InvalidParameter("6to4 requires a relay".to_string())
                })?;
                let relay: RelayAddress = relay.parse().map_err(|_| {
                    ConfigError::InvalidParameter("empty relay address".to_string())
                })?;
                MethodData::SixToFour { relay }
            }
        };

        Ok(ServiceConfig {
            id: id.to_string(),
            interface: setup.interface.clone(),
            method,
            data,
        })
    }
}

/// Store key of a service's setup record.
pub fn setup_key(id: &str) -> String {
    format!("{SETUP_PREFIX}{id}/ipv6")
}

/// Service ID out of a setup key, if the key is one.
pub fn parse_setup_key(key: &str) -> Option<&str> {
    key.strip_prefix(SETUP_PREFIX)?.strip_suffix("/ipv6")
}

/// Primary IPv4 service record read from the store.
pub fn parse_ipv4_primary(value: Option<&Value>) -> Ipv4Primary {
    let mut primary = Ipv4Primary::default();
    let Some(list) = value.and_then(|v| v["addresses"].as_array()) else {
        return primary;
    };
    primary.addresses = list
        .iter()
        .filter_map(|a| a.as_str())
        .filter_map(|a| a.parse::<Ipv4Addr>().ok())
        .collect();
    primary
}

/// On-disk preferences: the service entries seeded into the store when the
/// daemon starts.
#[derive(Debug, Default, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub services: Vec<PreferenceService>,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceService {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub setup: ServiceSetup,
}

pub fn load_preferences(path: &Path) -> anyhow::Result<Preferences> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading preferences {}", path.display()))?;
    let prefs: Preferences = serde_json::from_str(&raw)
        .with_context(|| format!("parsing preferences {}", path.display()))?;
    Ok(prefs)
}

/// Write every preference entry into the store; entries without an ID get a
/// generated one.
pub fn seed_store(store: &mut Store, prefs: &Preferences) {
    for entry in &prefs.services {
        let id = entry
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = serde_json::to_value(&entry.setup) {
            store.set(&setup_key(&id), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_manual_setup_conversion() {
        let setup = ServiceSetup {
            interface: "en0".to_string(),
            method: "manual".to_string(),
            addresses: vec!["2001:db8::1".parse().unwrap(), "2001:db8::2".parse().unwrap()],
            prefix_lens: vec![56],
            relay: None,
        };
        let config = ServiceConfig::from_setup("s1", &setup).unwrap();
        assert_eq!(config.method, MethodId::Manual);
        let MethodData::Manual { addresses } = &config.data else {
            panic!("expected manual data");
        };
        assert_eq!(addresses[0].prefix_len, 56);
        // Missing prefix length falls back to the default.
        assert_eq!(addresses[1].prefix_len, 64);
    }

    #[test]
    fn test_unknown_and_private_methods_rejected() {
        let mut setup = ServiceSetup {
            interface: "en0".to_string(),
            method: "dhcp".to_string(),
            addresses: vec![],
            prefix_lens: vec![],
            relay: None,
        };
        let err = ServiceConfig::from_setup("s1", &setup).unwrap_err();
        assert_eq!(err.kind(), "operation-not-supported");

        setup.method = "link-local".to_string();
        let err = ServiceConfig::from_setup("s1", &setup).unwrap_err();
        assert_eq!(err.kind(), "invalid-operation");
    }

    #[test]
    fn test_6to4_requires_relay() {
        let mut setup = ServiceSetup {
            interface: "stf0".to_string(),
            method: "6to4".to_string(),
            addresses: vec![],
            prefix_lens: vec![],
            relay: None,
        };
        let err = ServiceConfig::from_setup("s1", &setup).unwrap_err();
        assert_eq!(err.kind(), "invalid-parameter");

        setup.relay = Some("192.88.99.1".to_string());
        let config = ServiceConfig::from_setup("s1", &setup).unwrap();
        assert_eq!(config.method, MethodId::SixToFour);
    }

    #[test]
    fn test_setup_key_roundtrip() {
        let key = setup_key("abc-123");
        assert_eq!(parse_setup_key(&key), Some("abc-123"));
        assert_eq!(parse_setup_key("state/network/global/ipv4"), None);
    }

    #[test]
    fn test_parse_ipv4_primary() {
        let value = json!({"addresses": ["10.0.0.2", "198.51.100.17", "bogus"]});
        let primary = parse_ipv4_primary(Some(&value));
        assert_eq!(primary.addresses.len(), 2);
        assert!(parse_ipv4_primary(None).addresses.is_empty());
    }

    #[test]
    fn test_preferences_seeding() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "services": [
                    {{"id": "uplink", "interface": "en0", "method": "automatic"}},
                    {{"interface": "en1", "method": "manual",
                      "addresses": ["2001:db8::5"], "prefix_lens": [64]}}
                ]
            }}"#
        )
        .unwrap();

        let prefs = load_preferences(file.path()).unwrap();
        assert_eq!(prefs.services.len(), 2);

        let mut store = Store::new();
        seed_store(&mut store, &prefs);
        assert!(store.get(&setup_key("uplink")).is_some());
        // The unnamed entry got a generated ID.
        assert_eq!(store.list(SETUP_PREFIX).len(), 2);
    }
}
