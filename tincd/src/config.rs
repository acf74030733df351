// SPDX-License-Identifier: MIT

//! The parsed configuration object C7 consumes (§4.10). On-disk parsing of the real
//! `tincd.conf`/`hosts/*` format is deliberately undramatic here — the specification
//! puts config parsing out of scope and only requires that the core have *something*
//! concrete to consume, so this loader is a small `Key = Value` reader rather than a
//! full grammar.

use crate::error::DaemonError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// One claimed destination prefix, e.g. `10.1.0.0/16`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubnetClaim {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl std::fmt::Display for SubnetClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl std::str::FromStr for SubnetClaim {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| DaemonError::Config(format!("{s}: missing prefix length")))?;
        let address: IpAddr = addr
            .parse()
            .map_err(|_| DaemonError::Config(format!("{s}: invalid address")))?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| DaemonError::Config(format!("{s}: invalid prefix length")))?;
        Ok(SubnetClaim { address, prefix_len })
    }
}

/// On-disk record for one peer, as loaded from `hosts/<name>`.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    pub public_key_fingerprint: String,
    pub subnets: Vec<SubnetClaim>,
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// The net-wide configuration the core consumes.
#[derive(Debug, Clone)]
pub struct Config {
    pub net_name: Option<String>,
    pub listen_port: u16,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub key_rotation_interval: Duration,
    pub hosts: Vec<HostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            net_name: None,
            listen_port: 655,
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
            key_rotation_interval: Duration::from_secs(3600),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    /// Loads `<base_dir>/tincd.conf` plus every file under `<base_dir>/hosts/`.
    /// Missing `hosts/` is not an error (a fresh net may have no peers yet); a
    /// missing `tincd.conf` is.
    pub fn load(base_dir: &Path, net_name: Option<String>) -> Result<Config, DaemonError> {
        let main_path = base_dir.join("tincd.conf");
        let text = std::fs::read_to_string(&main_path).map_err(|e| {
            DaemonError::Config(format!("{}: {e}", main_path.display()))
        })?;
        let kv = parse_key_value(&text)?;

        let mut cfg = Config {
            net_name,
            ..Config::default()
        };
        if let Some(v) = kv.get("Port") {
            cfg.listen_port = v
                .parse()
                .map_err(|_| DaemonError::Config(format!("Port: invalid value {v}")))?;
        }
        if let Some(v) = kv.get("PingInterval") {
            cfg.ping_interval = Duration::from_secs(
                v.parse()
                    .map_err(|_| DaemonError::Config(format!("PingInterval: invalid value {v}")))?,
            );
        }
        if let Some(v) = kv.get("PingTimeout") {
            cfg.ping_timeout = Duration::from_secs(
                v.parse()
                    .map_err(|_| DaemonError::Config(format!("PingTimeout: invalid value {v}")))?,
            );
        }
        if let Some(v) = kv.get("KeyExpire") {
            cfg.key_rotation_interval = Duration::from_secs(
                v.parse()
                    .map_err(|_| DaemonError::Config(format!("KeyExpire: invalid value {v}")))?,
            );
        }

        let hosts_dir = base_dir.join("hosts");
        if hosts_dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(&hosts_dir)
                .map_err(|e| DaemonError::Config(format!("{}: {e}", hosts_dir.display())))?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let text = std::fs::read_to_string(entry.path())
                    .map_err(|e| DaemonError::Config(format!("{}: {e}", entry.path().display())))?;
                cfg.hosts.push(parse_host_config(&name, &text)?);
            }
        }

        Ok(cfg)
    }

    pub fn find_host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }
}

fn parse_key_value(text: &str) -> Result<HashMap<String, String>, DaemonError> {
    let mut map = HashMap::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            DaemonError::Config(format!("line {}: expected 'Key = Value'", lineno + 1))
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn parse_host_config(name: &str, text: &str) -> Result<HostConfig, DaemonError> {
    let kv = parse_key_value(text)?;
    let mut host = HostConfig {
        name: name.to_string(),
        public_key_fingerprint: kv
            .get("PublicKeyFingerprint")
            .cloned()
            .ok_or_else(|| DaemonError::Config(format!("{name}: missing PublicKeyFingerprint")))?,
        subnets: Vec::new(),
        address: kv.get("Address").cloned(),
        port: None,
    };
    if let Some(p) = kv.get("Port") {
        host.port = Some(
            p.parse()
                .map_err(|_| DaemonError::Config(format!("{name}: invalid Port {p}")))?,
        );
    }
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("Subnet") {
            let rest = rest.trim_start_matches('=').trim();
            host.subnets.push(rest.parse().map_err(|_: DaemonError| {
                DaemonError::Config(format!("{name} line {}: invalid subnet {rest}", lineno + 1))
            })?);
        }
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_main_config_and_hosts() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("tincd.conf"),
            "Port = 1655\nPingInterval = 30\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("hosts")).unwrap();
        fs::write(
            dir.path().join("hosts").join("alpha"),
            "PublicKeyFingerprint = deadbeef\nSubnet = 10.1.0.0/16\nAddress = 203.0.113.1\n",
        )
        .unwrap();

        let cfg = Config::load(dir.path(), Some("v1".into())).unwrap();
        assert_eq!(cfg.listen_port, 1655);
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.hosts.len(), 1);
        let alpha = cfg.find_host("alpha").unwrap();
        assert_eq!(alpha.public_key_fingerprint, "deadbeef");
        assert_eq!(alpha.subnets[0].to_string(), "10.1.0.0/16");
        assert_eq!(alpha.address.as_deref(), Some("203.0.113.1"));
    }

    #[test]
    fn missing_main_config_is_config_error() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path(), None).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn missing_hosts_dir_yields_empty_host_list() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tincd.conf"), "Port = 655\n").unwrap();
        let cfg = Config::load(dir.path(), None).unwrap();
        assert!(cfg.hosts.is_empty());
    }
}
