// SPDX-License-Identifier: MIT

//! The control-channel client half of the observer (C9, §4.9): opens the admin
//! UNIX socket, issues `DUMP_TRAFFIC`, and keeps a lexicographically-ordered list of
//! per-node counters and derived per-second rates.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DUMP_TRAFFIC_SENTINEL: &str = "CONTROL DUMP_TRAFFIC";

/// One node's traffic counters plus the rates derived from the last two dumps
/// (§3 `TrafficSnapshot`).
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub name: String,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
    pub in_packet_rate: f64,
    pub in_byte_rate: f64,
    pub out_packet_rate: f64,
    pub out_byte_rate: f64,
    /// Whether this node appeared in the most recently completed dump. A node
    /// missing from a dump keeps its last counters but is rendered DIM (§4.9.3).
    pub known: bool,
}

impl NodeStats {
    pub fn total_packets(&self) -> u64 {
        self.in_packets + self.out_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.in_bytes + self.out_bytes
    }
}

/// Maintains the connection and the ordered node list across ticks.
pub struct Client {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
    nodes: Vec<NodeStats>,
    last_dump_start: Option<Instant>,
}

impl Client {
    pub fn new(socket_path: PathBuf) -> Self {
        Client {
            socket_path,
            stream: None,
            nodes: Vec::new(),
            last_dump_start: None,
        }
    }

    pub fn nodes(&self) -> &[NodeStats] {
        &self.nodes
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("{}: connect failed", self.socket_path.display()))?;
        stream.set_read_timeout(Some(Duration::from_millis(500)))?;
        let mut reader = BufReader::new(stream);
        let mut greeting = String::new();
        reader
            .read_line(&mut greeting)
            .context("reading CONTROL greeting")?;
        if !greeting.starts_with("CONTROL ") {
            anyhow::bail!("unexpected greeting: {greeting:?}");
        }
        self.stream = Some(reader);
        Ok(())
    }

    /// Performs one `DUMP_TRAFFIC` round trip and folds the result into `self.nodes`
    /// (§4.9 steps 1-3). Reconnects transparently if the previous connection died.
    pub fn poll(&mut self) -> Result<()> {
        if let Err(e) = self.ensure_connected() {
            self.stream = None;
            return Err(e);
        }

        let now = Instant::now();
        let interval = self
            .last_dump_start
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .filter(|secs| *secs > 0.0);
        self.last_dump_start = Some(now);

        let result = self.round_trip();
        let lines = match result {
            Ok(lines) => lines,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };

        for node in &mut self.nodes {
            node.known = false;
        }

        for line in lines {
            let Some(parsed) = parse_traffic_line(&line) else {
                continue;
            };
            self.apply(parsed, interval);
        }

        Ok(())
    }

    fn round_trip(&mut self) -> Result<Vec<String>> {
        let reader = self.stream.as_mut().expect("connected");
        reader.get_mut().write_all(b"DUMP_TRAFFIC\n")?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                anyhow::bail!("control channel closed mid-dump");
            }
            let line = line.trim_end_matches('\n').to_string();
            if line == DUMP_TRAFFIC_SENTINEL {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }

    fn apply(&mut self, parsed: ParsedLine, interval: Option<f64>) {
        let idx = self.nodes.partition_point(|n| n.name.as_str() < parsed.name.as_str());
        let is_new = self.nodes.get(idx).map(|n| n.name != parsed.name).unwrap_or(true);
        if is_new {
            self.nodes.insert(
                idx,
                NodeStats {
                    name: parsed.name.clone(),
                    ..NodeStats::default()
                },
            );
        }
        let node = &mut self.nodes[idx];

        if let Some(secs) = interval {
            node.in_packet_rate = rate(parsed.in_packets, node.in_packets, secs);
            node.in_byte_rate = rate(parsed.in_bytes, node.in_bytes, secs);
            node.out_packet_rate = rate(parsed.out_packets, node.out_packets, secs);
            node.out_byte_rate = rate(parsed.out_bytes, node.out_bytes, secs);
        }
        node.in_packets = parsed.in_packets;
        node.in_bytes = parsed.in_bytes;
        node.out_packets = parsed.out_packets;
        node.out_bytes = parsed.out_bytes;
        node.known = true;
    }
}

fn rate(new: u64, old: u64, interval_seconds: f64) -> f64 {
    if interval_seconds <= 0.0 {
        return 0.0;
    }
    (new.saturating_sub(old)) as f64 / interval_seconds
}

struct ParsedLine {
    name: String,
    in_packets: u64,
    in_bytes: u64,
    out_packets: u64,
    out_bytes: u64,
}

/// Parses one `CONTROL DUMP_TRAFFIC <name> <in_pkts> <in_bytes> <out_pkts>
/// <out_bytes>` line (§4.9). Malformed lines are skipped rather than treated as
/// fatal, since a single garbled line shouldn't take down the whole tick.
fn parse_traffic_line(line: &str) -> Option<ParsedLine> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "CONTROL" || parts.next()? != "DUMP_TRAFFIC" {
        return None;
    }
    Some(ParsedLine {
        name: parts.next()?.to_string(),
        in_packets: parts.next()?.parse().ok()?,
        in_bytes: parts.next()?.parse().ok()?,
        out_packets: parts.next()?.parse().ok()?,
        out_bytes: parts.next()?.parse().ok()?,
    })
}

#[allow(dead_code)]
pub fn default_socket_path(net_name: Option<&str>) -> PathBuf {
    match net_name {
        Some(name) => Path::new("/var/run").join(format!("tincd.{name}.control")),
        None => Path::new("/var/run/tincd.control").to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_traffic_line_rejects_garbage() {
        assert!(parse_traffic_line("nonsense").is_none());
        assert!(parse_traffic_line("CONTROL DUMP_TRAFFIC").is_none());
    }

    #[test]
    fn parse_traffic_line_extracts_fields() {
        let parsed = parse_traffic_line("CONTROL DUMP_TRAFFIC alpha 10 2000 5 900").unwrap();
        assert_eq!(parsed.name, "alpha");
        assert_eq!(parsed.in_packets, 10);
        assert_eq!(parsed.out_bytes, 900);
    }

    #[test]
    fn rate_computes_delta_over_interval() {
        assert_eq!(rate(110, 100, 2.0), 5.0);
        assert_eq!(rate(100, 110, 2.0), 0.0); // counters shouldn't go backwards
    }

    #[test]
    fn apply_inserts_nodes_in_lexicographic_order() {
        let mut client = Client::new(PathBuf::from("/nonexistent"));
        client.apply(
            ParsedLine {
                name: "bravo".into(),
                in_packets: 1,
                in_bytes: 1,
                out_packets: 1,
                out_bytes: 1,
            },
            None,
        );
        client.apply(
            ParsedLine {
                name: "alpha".into(),
                in_packets: 2,
                in_bytes: 2,
                out_packets: 2,
                out_bytes: 2,
            },
            None,
        );
        let names: Vec<&str> = client.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo"]);
    }

    #[test]
    fn unseen_node_retains_counters_but_is_marked_unknown() {
        let mut client = Client::new(PathBuf::from("/nonexistent"));
        client.apply(
            ParsedLine {
                name: "alpha".into(),
                in_packets: 5,
                in_bytes: 5,
                out_packets: 5,
                out_bytes: 5,
            },
            None,
        );
        for node in &mut client.nodes {
            node.known = false;
        }
        assert_eq!(client.nodes[0].in_packets, 5);
        assert!(!client.nodes[0].known);
    }
}
