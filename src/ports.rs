//! Port string translation between container descriptors, firewall rules and
//! router port mappings.
//!
//! Firewall port strings look like `25565/tcp|7000:7002/udp|27015`: entries are
//! `|`-separated, `A:B` is an inclusive range and a missing protocol means both
//! tcp and udp.

use std::fmt;
use std::path::Path;

use serde_yaml::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFormatError {
    entry: String,
}

impl fmt::Display for PortFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid port entry {:?}", self.entry)
    }
}

impl std::error::Error for PortFormatError {}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

/// Translate a container descriptor's declared ports into a firewall port string.
///
/// Accepts the text of a compose document and scans every service's `ports`.
/// Short-syntax entries `N[:M]/proto` are kept as written; `host:container`
/// pairs without a protocol, or with differing ports, contribute the host port.
/// Long-syntax mappings contribute `published[/protocol]`. Anything else is
/// dropped. Never fails: unparseable input yields an empty string.
pub fn compose_to_firewall_ports(descriptor: &str) -> String {
    let Ok(doc) = serde_yaml::from_str::<Value>(descriptor) else {
        return String::new();
    };

    let mut entries: Vec<String> = Vec::new();
    let services = doc.get("services").and_then(Value::as_mapping);
    for service in services.into_iter().flat_map(|m| m.values()) {
        let Some(ports) = service.get("ports").and_then(Value::as_sequence) else {
            continue;
        };
        for port in ports {
            if let Some(entry) = compose_port_entry(port) {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
    }
    entries.join("|")
}

fn compose_port_entry(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => short_syntax_entry(s.trim()),
        Value::Mapping(_) => {
            let published = match value.get("published")? {
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(s) => parse_port(s),
                _ => None,
            }?;
            match value.get("protocol").and_then(Value::as_str) {
                Some(proto) => Protocol::parse(proto).map(|p| format!("{}/{}", published, p.as_str())),
                None => Some(published.to_string()),
            }
        }
        // A bare number only names the container port; nothing is published.
        _ => None,
    }
}

fn short_syntax_entry(s: &str) -> Option<String> {
    let (mapping, proto) = match s.split_once('/') {
        Some((mapping, proto)) => (mapping, Some(Protocol::parse(proto)?)),
        None => (s, None),
    };
    let (host, container) = mapping.split_once(':')?;
    let host_port = parse_port(host)?;
    let container_port = parse_port(container)?;

    match proto {
        Some(proto) if host_port <= container_port => {
            Some(format!("{}:{}/{}", host_port, container_port, proto.as_str()))
        }
        Some(proto) => Some(format!("{}/{}", host_port, proto.as_str())),
        None => Some(host_port.to_string()),
    }
}

/// Expand a firewall port string into `"<port> <protocol>"` router mappings.
///
/// Ranges expand to one line per port; entries without a protocol expand to
/// both tcp and udp. An empty string is valid and yields no mappings; any
/// malformed entry fails the whole call.
pub fn firewall_to_router_ports(rule: &str) -> Result<Vec<String>, PortFormatError> {
    let mut out = Vec::new();
    let rule = rule.trim();
    if rule.is_empty() {
        return Ok(out);
    }

    for raw in rule.split('|') {
        let entry = raw.trim();
        let invalid = || PortFormatError {
            entry: entry.to_string(),
        };

        let (ports, protocols): (&str, Vec<Protocol>) = match entry.split_once('/') {
            Some((ports, proto)) => (ports, vec![Protocol::parse(proto).ok_or_else(invalid)?]),
            None => (entry, vec![Protocol::Tcp, Protocol::Udp]),
        };

        let (start, end) = match ports.split_once(':') {
            Some((a, b)) => (
                parse_port(a).ok_or_else(invalid)?,
                parse_port(b).ok_or_else(invalid)?,
            ),
            None => {
                let p = parse_port(ports).ok_or_else(invalid)?;
                (p, p)
            }
        };
        if start > end {
            return Err(invalid());
        }

        for port in start..=end {
            for proto in &protocols {
                out.push(format!("{} {}", port, proto.as_str()));
            }
        }
    }
    Ok(out)
}

const BLUEPRINT_SUFFIXES: [&str; 3] = [".docker-compose.yml", ".docker-compose.yaml", ".bp"];

/// Canonical blueprint identifier for a path such as
/// `/opt/blueprints/valheim.docker-compose.yml` or `factorio.bp`.
pub fn extract_blueprint_name(path: &str) -> String {
    let file = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    for suffix in BLUEPRINT_SUFFIXES {
        if let Some(stem) = file.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    file.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_keeps_protocol_entries_verbatim() {
        let compose = "services:\n  mc:\n    image: itzg/minecraft-server\n    ports:\n      - \"25565:25565/tcp\"\n";
        assert_eq!(compose_to_firewall_ports(compose), "25565:25565/tcp");
    }

    #[test]
    fn compose_without_ports_is_empty() {
        let compose = "services:\n  mc:\n    image: itzg/minecraft-server\n";
        assert_eq!(compose_to_firewall_ports(compose), "");
        assert_eq!(compose_to_firewall_ports(""), "");
        assert_eq!(compose_to_firewall_ports(":: not yaml ::\n  - ["), "");
    }

    #[test]
    fn compose_mixed_entries() {
        let compose = r#"
services:
  game:
    ports:
      - "7777:7777"
      - "27015:27015/udp"
      - "8080:80/tcp"
      - "bogus"
      - 9000
      - target: 2456
        published: 2456
        protocol: udp
  sidecar:
    ports:
      - "7777:7777"
"#;
        assert_eq!(
            compose_to_firewall_ports(compose),
            "7777|27015:27015/udp|8080/tcp|2456/udp"
        );
    }

    #[test]
    fn router_expands_ranges_and_bare_ports() {
        assert_eq!(
            firewall_to_router_ports("7000:7002/udp").unwrap(),
            vec!["7000 udp", "7001 udp", "7002 udp"]
        );
        assert_eq!(
            firewall_to_router_ports("27015").unwrap(),
            vec!["27015 tcp", "27015 udp"]
        );
        assert!(firewall_to_router_ports("").unwrap().is_empty());
    }

    #[test]
    fn router_rejects_malformed_entries() {
        assert!(firewall_to_router_ports("25565/tcp|abc").is_err());
        assert!(firewall_to_router_ports("25565/sctp").is_err());
        assert!(firewall_to_router_ports("9000:8000/tcp").is_err());
        assert!(firewall_to_router_ports("25565/tcp|").is_err());
    }

    #[test]
    fn compose_output_round_trips_through_router() {
        let compose = "services:\n  srv:\n    ports:\n      - \"7000:7002/udp\"\n      - \"25565:25565/tcp\"\n";
        let rule = compose_to_firewall_ports(compose);
        assert_eq!(
            firewall_to_router_ports(&rule).unwrap(),
            vec!["7000 udp", "7001 udp", "7002 udp", "25565 tcp"]
        );
    }

    #[test]
    fn blueprint_names_strip_known_suffixes() {
        assert_eq!(extract_blueprint_name("/opt/bp/factorio.bp"), "factorio");
        assert_eq!(
            extract_blueprint_name("custom/valheim.docker-compose.yml"),
            "valheim"
        );
        assert_eq!(
            extract_blueprint_name("minecraft.docker-compose.yaml"),
            "minecraft"
        );
        assert_eq!(extract_blueprint_name("terraria"), "terraria");
    }
}
