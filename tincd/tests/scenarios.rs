// SPDX-License-Identifier: MIT

//! End-to-end scenarios exercised against the public API rather than spawned
//! subprocesses (contrast with `daemon/tests/test.rs`, which spawns real children
//! because it's testing process supervision; here the behavior under test is
//! purely in-process protocol/registry logic).

use tincd::config::SubnetClaim;
use tincd::control::{render_dump, render_traffic_dump, ControlCommand};
use tincd::crypto::{CipherSuite, PlaceholderCipher};
use tincd::error::DaemonError;
use tincd::meta::{handle_line, parse_line, HandshakeCtx, HandshakeState};
use tincd::names::{acquire_pid_lock, kill_other, NetIdentity};
use tincd::registry::{Connection, Registry};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn peer_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 655)
}

fn identity(dir: &std::path::Path, net: &str) -> NetIdentity {
    NetIdentity::new(Some(net.to_string()), dir.join("etc"), dir.join("run"))
}

/// Scenario 1/2 in §8: a second instance for the same net must not start while the
/// first is alive, and `--kill` must remove even a stale (dead-pid) lock.
#[test]
fn startup_race_and_kill_other() {
    let dir = tempfile::tempdir().unwrap();
    let id = identity(dir.path(), "v1");

    let _first_lock = acquire_pid_lock(&id).unwrap();
    let err = acquire_pid_lock(&id).unwrap_err();
    assert!(err.to_string().contains("already running"));

    // Our own pid is alive, so kill_other will actually signal us; instead simulate
    // the stale-lock path, which is the one §8 calls out explicitly.
    std::fs::write(id.pid_file(), "999999\n").unwrap();
    kill_other(&id).unwrap();
    assert!(!id.pid_file().exists());
}

/// Scenario: broadcast fan-out must reach every other active connection and must
/// never loop back to its origin (§8 invariant 3).
#[test]
fn broadcast_fan_out_excludes_origin() {
    let mut registry = Registry::new("self", "fp");
    let a = registry
        .insert(Connection::new("a".into(), peer_addr(), true))
        .unwrap();
    let b = registry
        .insert(Connection::new("b".into(), peer_addr(), true))
        .unwrap();
    let c = registry
        .insert(Connection::new("c".into(), peer_addr(), true))
        .unwrap();
    for id in [a, b, c] {
        registry.get_mut(id).unwrap().flags.active = true;
    }

    registry.broadcast_except(a, b"12 x y\n");

    assert!(registry.get(a).unwrap().outbound_queue.is_empty());
    assert_eq!(registry.get(b).unwrap().outbound_queue, b"12 x y\n");
    assert_eq!(registry.get(c).unwrap().outbound_queue, b"12 x y\n");
}

/// Scenario: a bad CHAL_REPLY digest must fail the handshake with `Auth`, not
/// silently proceed to ACTIVE.
#[test]
fn handshake_fails_on_wrong_digest() {
    let mut registry = Registry::new("self", "fp");
    let conn_id = registry
        .insert(Connection::new("peer".into(), peer_addr(), false))
        .unwrap();
    let mut ctx = HandshakeCtx::new(false);
    let cipher = PlaceholderCipher;

    handle_line(b"0 peer", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
    let sealed = cipher.seal_with_identity("peer", b"shared-session-key-bytes-123456").unwrap();
    let line = format!("1 {}", String::from_utf8_lossy(&sealed));
    handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();

    // Skip the real CHALLENGE round trip and present a bogus reply directly.
    ctx.state = HandshakeState::AwaitChalReply;
    ctx.expected_digest = Some(vec![0xAA, 0xBB]);
    let err = handle_line(b"3 ffff", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap_err();
    assert!(matches!(err, DaemonError::Auth(_)));
    assert!(!registry.get(conn_id).unwrap().flags.authenticated);
}

/// Scenario: `DUMP_TRAFFIC` output matches the pinned wire format exactly (§8.5).
#[test]
fn traffic_dump_formatting_matches_specification() {
    let mut registry = Registry::new("alpha", "fpa");
    let bravo = registry.add_node("bravo", "fpb");
    if let Some(n) = registry.node_mut(bravo) {
        n.counters.in_packets_socket = 20;
        n.counters.in_bytes_socket = 2000;
        n.counters.out_packets_socket = 4;
        n.counters.out_bytes_socket = 400;
    }
    let self_id = registry.self_node_id();
    if let Some(n) = registry.node_mut(self_id) {
        n.counters.in_packets_socket = 10;
        n.counters.in_bytes_socket = 1000;
        n.counters.out_packets_socket = 2;
        n.counters.out_bytes_socket = 200;
    }

    let dump = render_traffic_dump(&registry);
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines[0], "CONTROL DUMP_TRAFFIC alpha 10 1000 2 200");
    assert_eq!(lines[1], "CONTROL DUMP_TRAFFIC bravo 20 2000 4 400");
    assert_eq!(lines[2], "CONTROL DUMP_TRAFFIC");
}

/// Scenario: subnet conflicts are rejected and reported through the same
/// `DUMP_SUBNETS` control path an admin would use to inspect the running state.
#[test]
fn subnet_conflict_is_rejected_and_dump_reflects_only_winner() {
    let mut registry = Registry::new("self", "fp");
    let x = registry.add_node("x", "fpx");
    let y = registry.add_node("y", "fpy");
    registry
        .add_subnet(x, "10.1.0.0/16".parse().unwrap())
        .unwrap();
    let conflict: SubnetClaim = "10.1.5.0/24".parse().unwrap();
    assert!(registry.add_subnet(y, conflict).is_err());

    let dump = render_dump(&ControlCommand::DumpSubnets, &registry);
    assert!(dump.contains("SUBNET x 10.1.0.0/16"));
    assert!(!dump.contains("SUBNET y"));
    assert!(dump.ends_with("CONTROL DUMP_SUBNETS\n"));
}

/// `parse_line` round-trips the handshake's own encoded lines, confirming the
/// wire format the rest of these scenarios assume.
#[test]
fn parse_line_handles_zero_argument_requests() {
    let (request, args) = parse_line(b"7").unwrap();
    assert_eq!(request, tincd::meta::Request::Termreq);
    assert!(args.is_empty());
}
