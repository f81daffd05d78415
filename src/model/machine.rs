use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A machine known to the discovery layer. `properties` carries whatever the
/// machine advertises about itself (memory, cpu, attached hardware, ...) and is
/// what expression constraints are evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
}

impl Machine {
    /// Human-facing name, falling back to the hostname when no name is set.
    pub fn display_name(&self) -> Option<String> {
        self.name.clone().or_else(|| self.hostname.clone())
    }

    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            id: self.id.clone(),
            ip: self.ip.clone(),
            name: self.display_name(),
        }
    }
}

/// The slice of machine identity stamped onto instance log entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSummary {
    pub id: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Target recorded on a token when it is handed off to another machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NextMachine {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Answer of the `GET /machine/id,name,hostname` identity probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineProbe {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Splits a static machine address into host and port. Accepts `ip:port` and
/// the bracketed IPv6 form `[addr]:port`.
pub fn parse_machine_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_address() {
        assert_eq!(
            parse_machine_address("192.168.1.1:33029"),
            Some(("192.168.1.1".to_string(), 33029))
        );
    }

    #[test]
    fn parses_bracketed_ipv6_address() {
        assert_eq!(
            parse_machine_address("[fe80::1]:8080"),
            Some(("fe80::1".to_string(), 8080))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_machine_address("not-an-address"), None);
        assert_eq!(parse_machine_address(":80"), None);
        assert_eq!(parse_machine_address("10.0.0.1:"), None);
    }

    #[test]
    fn name_falls_back_to_hostname() {
        let m = Machine {
            id: "m1".into(),
            name: None,
            hostname: Some("box-1".into()),
            ip: "10.0.0.1".into(),
            port: 33029,
            properties: HashMap::new(),
        };
        assert_eq!(m.display_name(), Some("box-1".to_string()));
        assert_eq!(m.summary().name, Some("box-1".to_string()));
    }
}
