// SPDX-License-Identifier: MIT

//! The control channel (C6, §4.6): a UNIX-domain admin socket offering the same
//! line-oriented framing as the meta-protocol but a disjoint, privileged codeset,
//! gated by peer credentials rather than the cryptographic handshake.

use crate::error::DaemonError;
use crate::registry::Registry;
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::Uid;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// Protocol version advertised in the opening `CONTROL` line (§4.6).
pub const CONTROL_VERSION: u32 = 1;

/// Commands the control channel accepts. Distinct from `meta::Request` — this is a
/// privileged, local-only codeset, never sent over the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Reload,
    DumpNodes,
    DumpEdges,
    DumpSubnets,
    DumpConnections,
    DumpTraffic,
    Purge,
    SetDebug(u8),
    Retry,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<ControlCommand, DaemonError> {
        let mut parts = line.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| DaemonError::Protocol("empty control command".into()))?;
        match verb {
            "STOP" => Ok(ControlCommand::Stop),
            "RELOAD" => Ok(ControlCommand::Reload),
            "DUMP_NODES" => Ok(ControlCommand::DumpNodes),
            "DUMP_EDGES" => Ok(ControlCommand::DumpEdges),
            "DUMP_SUBNETS" => Ok(ControlCommand::DumpSubnets),
            "DUMP_CONNECTIONS" => Ok(ControlCommand::DumpConnections),
            "DUMP_TRAFFIC" => Ok(ControlCommand::DumpTraffic),
            "PURGE" => Ok(ControlCommand::Purge),
            "RETRY" => Ok(ControlCommand::Retry),
            "SET_DEBUG" => {
                let level: u8 = parts
                    .next()
                    .ok_or_else(|| DaemonError::Protocol("SET_DEBUG: missing level".into()))?
                    .parse()
                    .map_err(|_| DaemonError::Protocol("SET_DEBUG: invalid level".into()))?;
                Ok(ControlCommand::SetDebug(level))
            }
            other => Err(DaemonError::Protocol(format!(
                "unknown control command {other}"
            ))),
        }
    }
}

/// A connected, not-yet-verified admin client. Credentials are checked once, at
/// accept time (§4.6): the control channel trusts the kernel-reported peer uid, not
/// anything the client sends.
pub struct ControlListener {
    listener: UnixListener,
    path: std::path::PathBuf,
}

impl ControlListener {
    /// Binds `path`, removing a stale socket file first (a leftover socket from a
    /// prior crash otherwise makes `bind` fail with `AddrInUse`, the same race the
    /// pidfile protocol in `names.rs` guards against with a live lock instead).
    pub fn bind(path: &Path) -> Result<ControlListener, DaemonError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(ControlListener {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts one pending connection, checking that the connecting process's uid
    /// is either root or the daemon's own uid (§4.6 access control). Rejected peers
    /// are dropped without a reply.
    pub fn accept(&self) -> std::io::Result<Option<(UnixStream, nix::unistd::Pid)>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                let creds = getsockopt(&stream, PeerCredentials).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
                let self_uid = Uid::current();
                if Uid::from_raw(creds.uid()) != self_uid && !Uid::from_raw(creds.uid()).is_root()
                {
                    tracing::warn!(uid = creds.uid(), "control connection rejected: wrong uid");
                    return Ok(None);
                }
                stream.set_nonblocking(true)?;
                Ok(Some((stream, nix::unistd::Pid::from_raw(creds.pid()))))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The opening line a freshly-accepted control client receives, before issuing any
/// command (§4.6).
pub fn greeting(our_pid: i32) -> String {
    format!("CONTROL {CONTROL_VERSION} {our_pid}\n")
}

/// The sentinel each `DUMP_*` command terminates its block with: the command's own
/// verb, repeated with zero operands (§4.6).
fn sentinel_for(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::DumpNodes => "CONTROL DUMP_NODES",
        ControlCommand::DumpEdges => "CONTROL DUMP_EDGES",
        ControlCommand::DumpSubnets => "CONTROL DUMP_SUBNETS",
        ControlCommand::DumpConnections => "CONTROL DUMP_CONNECTIONS",
        ControlCommand::DumpTraffic => "CONTROL DUMP_TRAFFIC",
        _ => "",
    }
}

/// Renders the response to a dump-style command, including its sentinel.
pub fn render_dump(command: &ControlCommand, registry: &Registry) -> String {
    let mut out = String::new();
    match command {
        ControlCommand::DumpNodes => {
            for (_, node) in registry.nodes() {
                out.push_str(&format!(
                    "NODE {} {} {}\n",
                    node.name,
                    node.fingerprint,
                    node.nexthop.is_some()
                ));
            }
        }
        ControlCommand::DumpEdges => {
            for edge in registry.edges() {
                let from = registry.node(edge.from).map(|n| n.name.as_str()).unwrap_or("?");
                let to = registry.node(edge.to).map(|n| n.name.as_str()).unwrap_or("?");
                out.push_str(&format!("EDGE {from} {to} {}\n", edge.weight));
            }
        }
        ControlCommand::DumpSubnets => {
            for (_, node) in registry.nodes() {
                for subnet in &node.subnets {
                    out.push_str(&format!("SUBNET {} {subnet}\n", node.name));
                }
            }
        }
        ControlCommand::DumpConnections => {
            for (_, conn) in registry.scan() {
                out.push_str(&format!(
                    "CONNECTION {} {} {} {}\n",
                    conn.remote_name, conn.remote_addr, conn.flags.active, conn.flags.authenticated
                ));
            }
        }
        _ => {}
    }
    out.push_str(sentinel_for(command));
    out.push('\n');
    out
}

/// `DUMP_TRAFFIC`'s wire shape is pinned exactly by the specification: for every
/// known node, `CONTROL DUMP_TRAFFIC <name> <in_pkts> <in_bytes> <out_pkts>
/// <out_bytes>`, then the bare sentinel `CONTROL DUMP_TRAFFIC`. `registry`'s
/// self-node counters are kept in sync with the data plane by the main loop, so no
/// separate self-counter argument is needed here.
pub fn render_traffic_dump(registry: &Registry) -> String {
    let mut out = String::new();
    for (_, node) in registry.nodes() {
        let c = node.counters;
        out.push_str(&format!(
            "CONTROL DUMP_TRAFFIC {} {} {} {} {}\n",
            node.name, c.in_packets_socket, c.in_bytes_socket, c.out_packets_socket, c.out_bytes_socket
        ));
    }
    out.push_str("CONTROL DUMP_TRAFFIC\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Connection;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn parses_known_commands() {
        assert_eq!(ControlCommand::parse("STOP").unwrap(), ControlCommand::Stop);
        assert_eq!(
            ControlCommand::parse("SET_DEBUG 3").unwrap(),
            ControlCommand::SetDebug(3)
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(ControlCommand::parse("BOGUS").is_err());
    }

    #[test]
    fn set_debug_requires_numeric_level() {
        assert!(ControlCommand::parse("SET_DEBUG nope").is_err());
    }

    #[test]
    fn dump_connections_lists_each_peer_and_sentinel() {
        let mut registry = Registry::new("self", "fp");
        registry
            .insert(Connection::new(
                "alpha".into(),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 655),
                true,
            ))
            .unwrap();
        let out = render_dump(&ControlCommand::DumpConnections, &registry);
        assert!(out.contains("CONNECTION alpha"));
        assert!(out.ends_with("CONTROL DUMP_CONNECTIONS\n"));
    }

    #[test]
    fn traffic_dump_matches_pinned_format() {
        let registry = Registry::new("self", "fp");
        let out = render_traffic_dump(&registry);
        assert!(out.contains("CONTROL DUMP_TRAFFIC self 0 0 0 0"));
        assert!(out.ends_with("CONTROL DUMP_TRAFFIC\n"));
    }

    #[test]
    fn greeting_includes_version_and_pid() {
        let line = greeting(42);
        assert_eq!(line, "CONTROL 1 42\n");
    }
}
