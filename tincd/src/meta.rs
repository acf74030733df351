// SPDX-License-Identifier: MIT

//! The meta-protocol engine (C5, §4.5): line framing, the per-connection handshake
//! state machine, and the request dispatch table. Socket I/O itself is owned by C7;
//! this module only ever sees already-read bytes and produces lines to write.

use crate::crypto::{CipherSuite, SessionKey};
use crate::error::DaemonError;
use crate::registry::{ConnId, Registry};
use std::time::{Duration, Instant};

/// Maximum encoded line length, including the trailing `\n` (§4.5).
pub const MAX_LINE_LEN: usize = 4096;

/// Meta-protocol version this build speaks (§4.5's `ID name version options`, §6). A
/// peer advertising a higher version is rejected with `IncompatibleVersion`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request codes dispatched on (§4.5). Matches the wire's decimal encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Request {
    Id = 0,
    MetaKey = 1,
    Challenge = 2,
    ChalReply = 3,
    Ack = 4,
    Status = 5,
    Error = 6,
    Termreq = 7,
    Ping = 8,
    Pong = 9,
    AddSubnet = 10,
    DelSubnet = 11,
    AddEdge = 12,
    DelEdge = 13,
    KeyChanged = 14,
    ReqKey = 15,
    AnsKey = 16,
    Packet = 17,
    AddNode = 18,
    DelNode = 19,
}

impl Request {
    fn from_code(code: u32) -> Option<Request> {
        use Request::*;
        Some(match code {
            0 => Id,
            1 => MetaKey,
            2 => Challenge,
            3 => ChalReply,
            4 => Ack,
            5 => Status,
            6 => Error,
            7 => Termreq,
            8 => Ping,
            9 => Pong,
            10 => AddSubnet,
            11 => DelSubnet,
            12 => AddEdge,
            13 => DelEdge,
            14 => KeyChanged,
            15 => ReqKey,
            16 => AnsKey,
            17 => Packet,
            18 => AddNode,
            19 => DelNode,
            _ => return None,
        })
    }

    /// Whether a successfully-handled line of this type should be rebroadcast to
    /// every other active connection (§4.5's "broadcast" column), as opposed to
    /// being purely point-to-point (handshake requests, PING/PONG).
    fn is_broadcast(self) -> bool {
        use Request::*;
        matches!(
            self,
            AddNode | DelNode | AddSubnet | DelSubnet | AddEdge | DelEdge | KeyChanged
        )
    }
}

/// Where a connection sits in the handshake (§4.5's state table). `Closed` is not
/// a distinct variant here: a closed connection is simply removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Just accepted/connected; nothing sent or received yet.
    Connect,
    /// Outgoing: our `ID` was sent, waiting for the peer's.
    IdSent,
    /// Incoming: waiting for the peer's `ID`.
    AwaitId,
    AwaitMetaKey,
    AwaitChallenge,
    AwaitChalReply,
    Authenticated,
    /// Past the handshake: subnets/edges/data may flow.
    Active,
}

impl HandshakeState {
    /// The minimum state (inclusive) each request is legal in (§4.5 dispatch table
    /// "minimum state" column). Requests below their minimum are a protocol violation.
    fn minimum_state_for(request: Request) -> HandshakeState {
        use HandshakeState::*;
        use Request::*;
        match request {
            Id => Connect,
            MetaKey => IdSent, // also legal from AwaitId via Connect transition
            Challenge => AwaitMetaKey,
            ChalReply => AwaitChallenge,
            Ack => AwaitChalReply,
            Status | Error | Termreq => Authenticated,
            Ping | Pong => Authenticated,
            AddNode | DelNode | AddSubnet | DelSubnet | AddEdge | DelEdge | KeyChanged | ReqKey
            | AnsKey | Packet => Active,
        }
    }

    fn rank(self) -> u8 {
        use HandshakeState::*;
        match self {
            Connect => 0,
            IdSent => 1,
            AwaitId => 1,
            AwaitMetaKey => 2,
            AwaitChallenge => 3,
            AwaitChalReply => 4,
            Authenticated => 5,
            Active => 6,
        }
    }
}

/// Per-connection handshake bookkeeping not already covered by `registry::Connection`.
pub struct HandshakeCtx {
    pub state: HandshakeState,
    pub session_key: Option<SessionKey>,
    pub expected_digest: Option<Vec<u8>>,
    pub last_ping_sent: Option<Instant>,
    pub waiting_for_pong: bool,
}

impl HandshakeCtx {
    pub fn new(outgoing: bool) -> Self {
        HandshakeCtx {
            state: if outgoing {
                HandshakeState::IdSent
            } else {
                HandshakeState::Connect
            },
            session_key: None,
            expected_digest: None,
            last_ping_sent: None,
            waiting_for_pong: false,
        }
    }
}

pub const PING_INTERVAL: Duration = Duration::from_secs(60);
pub const PING_GRACE: Duration = Duration::from_secs(5);

/// Splits `input` on `\n`, returning completed lines (without the terminator) and
/// the leftover partial tail to keep buffering. Enforces the 4096-byte cap and
/// rejects embedded NULs as a framing violation (§4.5).
pub fn extract_lines(input: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u8>), DaemonError> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &b) in input.iter().enumerate() {
        if b == b'\n' {
            let line = &input[start..i];
            if line.len() + 1 > MAX_LINE_LEN {
                return Err(DaemonError::Protocol(format!(
                    "line exceeds {MAX_LINE_LEN} bytes"
                )));
            }
            if line.contains(&0) {
                return Err(DaemonError::Protocol("embedded NUL in line".into()));
            }
            lines.push(line.to_vec());
            start = i + 1;
        }
    }
    let tail = input[start..].to_vec();
    if tail.len() + 1 > MAX_LINE_LEN {
        return Err(DaemonError::Protocol(format!(
            "line exceeds {MAX_LINE_LEN} bytes without a terminator"
        )));
    }
    Ok((lines, tail))
}

/// Parses a decoded line into its request code and space-separated arguments.
pub fn parse_line(line: &[u8]) -> Result<(Request, Vec<String>), DaemonError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| DaemonError::Protocol("line is not valid UTF-8".into()))?;
    let mut parts = text.split(' ').filter(|s| !s.is_empty());
    let code: u32 = parts
        .next()
        .ok_or_else(|| DaemonError::Protocol("empty line".into()))?
        .parse()
        .map_err(|_| DaemonError::Protocol("request code is not a number".into()))?;
    let request = Request::from_code(code)
        .ok_or_else(|| DaemonError::Protocol(format!("unknown request code {code}")))?;
    Ok((request, parts.map(str::to_string).collect()))
}

fn encode_line(code: Request, args: &[&str]) -> Vec<u8> {
    let mut out = (code as u32).to_string();
    for a in args {
        out.push(' ');
        out.push_str(a);
    }
    out.push('\n');
    out.into_bytes()
}

/// Builds the `ID name version options` line (§4.5's CONNECT → ID_SENT transition
/// and the reply an incoming `ID` gets). Used both by the handshake handler below
/// and by the main loop when it initiates an outgoing connection.
pub fn encode_id_line(self_name: &str) -> Vec<u8> {
    encode_line(Request::Id, &[self_name, &PROTOCOL_VERSION.to_string(), "0"])
}

/// The outcome of handling one line: bytes to write back to the sender (may be
/// empty), whether the line should be fanned out to other connections, and whether
/// the connection must be closed.
#[derive(Default)]
pub struct Outcome {
    pub reply: Vec<u8>,
    pub rebroadcast: Option<Vec<u8>>,
    pub close: bool,
}

/// Advances `conn`'s handshake/dispatch state by one line (§4.5). `self_name` and
/// `cipher` are the local identity and crypto collaborator; `registry` lets
/// handlers update subnets/edges and compute rebroadcasts.
pub fn handle_line(
    raw_line: &[u8],
    conn_id: ConnId,
    ctx: &mut HandshakeCtx,
    registry: &mut Registry,
    cipher: &dyn CipherSuite,
    self_name: &str,
) -> Result<Outcome, DaemonError> {
    let (request, args) = parse_line(raw_line)?;

    let minimum = HandshakeState::minimum_state_for(request);
    if ctx.state.rank() < minimum.rank() {
        return Err(DaemonError::Protocol(format!(
            "{request:?} illegal in state {:?}",
            ctx.state
        )));
    }

    match request {
        Request::Id => {
            let name = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("ID: missing name argument".into()))?;
            let peer_version: u32 = args
                .get(1)
                .map(|v| v.parse().unwrap_or(0))
                .unwrap_or(0);
            if peer_version > PROTOCOL_VERSION {
                return Err(DaemonError::IncompatibleVersion {
                    peer: peer_version,
                    ours: PROTOCOL_VERSION,
                });
            }
            let peer_options: u32 = args.get(2).and_then(|o| o.parse().ok()).unwrap_or(0);
            if let Some(conn) = registry.get_mut(conn_id) {
                conn.remote_name = name.clone();
                conn.peer_version = Some(peer_version);
                conn.options = peer_options;
            }
            ctx.state = HandshakeState::AwaitMetaKey;
            let reply = encode_id_line(self_name);
            Ok(Outcome {
                reply,
                ..Outcome::default()
            })
        }

        Request::MetaKey => {
            let sealed = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("METAKEY: missing payload".into()))?;
            let opened = cipher
                .open_with_identity(sealed.as_bytes())
                .map_err(|_| DaemonError::Auth("METAKEY: decrypt failed".into()))?;
            ctx.session_key = Some(SessionKey(opened));
            ctx.state = HandshakeState::AwaitChallenge;

            let mut nonce = vec![0u8; 16];
            cipher.random_bytes(&mut nonce);
            ctx.expected_digest = Some(cipher.digest(&nonce));
            let sealed = cipher
                .seal_with_session(ctx.session_key.as_ref().unwrap(), &nonce)
                .map_err(|e| DaemonError::Crypto(e.to_string()))?;
            let reply = encode_line(Request::Challenge, &[&hex::encode(&sealed)]);
            Ok(Outcome {
                reply,
                ..Outcome::default()
            })
        }

        Request::Challenge => {
            let hex_payload = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("CHALLENGE: missing payload".into()))?;
            let sealed = hex::decode(hex_payload)
                .map_err(|_| DaemonError::Protocol("CHALLENGE: invalid hex".into()))?;
            let key = ctx
                .session_key
                .as_ref()
                .ok_or_else(|| DaemonError::Protocol("CHALLENGE before METAKEY".into()))?;
            let nonce = cipher
                .open_with_session(key, &sealed)
                .map_err(|e| DaemonError::Crypto(e.to_string()))?;
            let digest = cipher.digest(&nonce);
            ctx.state = HandshakeState::AwaitChalReply;
            let reply = encode_line(Request::ChalReply, &[&hex::encode(&digest)]);
            Ok(Outcome {
                reply,
                ..Outcome::default()
            })
        }

        Request::ChalReply => {
            let hex_digest = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("CHAL_REPLY: missing digest".into()))?;
            let digest = hex::decode(hex_digest)
                .map_err(|_| DaemonError::Protocol("CHAL_REPLY: invalid hex".into()))?;
            let expected = ctx
                .expected_digest
                .as_ref()
                .ok_or_else(|| DaemonError::Protocol("CHAL_REPLY before CHALLENGE".into()))?;
            if &digest != expected {
                return Err(DaemonError::Auth("CHAL_REPLY: digest mismatch".into()));
            }
            ctx.state = HandshakeState::Authenticated;
            if let Some(conn) = registry.get_mut(conn_id) {
                conn.flags.authenticated = true;
                conn.flags.active = true;
            }
            ctx.state = HandshakeState::Active;

            // AWAIT_CHAL_REPLY -> AUTHENTICATED (§4.5): send ACK, then dump the local
            // topology so the newly authenticated peer starts from a consistent view
            // instead of waiting for the next incidental ADD_*/DEL_* broadcast.
            let mut reply = encode_line(Request::Ack, &[]);
            for (_, node) in registry.nodes() {
                reply.extend_from_slice(&encode_line(
                    Request::AddNode,
                    &[&node.name, &node.fingerprint],
                ));
                for subnet in &node.subnets {
                    reply.extend_from_slice(&encode_line(
                        Request::AddSubnet,
                        &[&node.name, &subnet.to_string()],
                    ));
                }
            }
            for edge in registry.edges() {
                let from = registry.node(edge.from).map(|n| n.name.as_str()).unwrap_or("");
                let to = registry.node(edge.to).map(|n| n.name.as_str()).unwrap_or("");
                reply.extend_from_slice(&encode_line(
                    Request::AddEdge,
                    &[from, to, &edge.weight.to_string()],
                ));
            }

            Ok(Outcome {
                reply,
                ..Outcome::default()
            })
        }

        Request::Ack => {
            if let Some(conn) = registry.get_mut(conn_id) {
                conn.flags.authenticated = true;
                conn.flags.active = true;
            }
            ctx.state = HandshakeState::Active;
            Ok(Outcome::default())
        }

        Request::Ping => Ok(Outcome {
            reply: encode_line(Request::Pong, &[]),
            ..Outcome::default()
        }),

        Request::Pong => {
            ctx.waiting_for_pong = false;
            Ok(Outcome::default())
        }

        Request::Termreq => Ok(Outcome {
            close: true,
            ..Outcome::default()
        }),

        Request::AddSubnet | Request::DelSubnet => {
            let owner_name = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("missing owner argument".into()))?;
            let subnet_str = args
                .get(1)
                .ok_or_else(|| DaemonError::Protocol("missing subnet argument".into()))?;
            let subnet: crate::config::SubnetClaim = subnet_str
                .parse()
                .map_err(|_| DaemonError::Protocol(format!("invalid subnet {subnet_str}")))?;
            let (owner_id, _) = registry
                .node_by_name(owner_name)
                .map(|(id, n)| (id, n.name.clone()))
                .unwrap_or_else(|| (registry.add_node(owner_name, ""), owner_name.clone()));

            if request == Request::AddSubnet {
                registry.add_subnet(owner_id, subnet)?;
            } else {
                registry.del_subnet(owner_id, &subnet);
            }
            Ok(Outcome {
                rebroadcast: Some(raw_line.to_vec()),
                ..Outcome::default()
            })
        }

        Request::AddEdge | Request::DelEdge => {
            let from_name = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("missing from-node argument".into()))?;
            let to_name = args
                .get(1)
                .ok_or_else(|| DaemonError::Protocol("missing to-node argument".into()))?;
            let from_id = registry
                .node_by_name(from_name)
                .map(|(id, _)| id)
                .unwrap_or_else(|| registry.add_node(from_name, ""));
            let to_id = registry
                .node_by_name(to_name)
                .map(|(id, _)| id)
                .unwrap_or_else(|| registry.add_node(to_name, ""));

            if request == Request::AddEdge {
                let weight: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1);
                registry.add_edge(from_id, to_id, weight, 0);
            } else {
                registry.del_edge(from_id, to_id);
            }
            Ok(Outcome {
                rebroadcast: Some(raw_line.to_vec()),
                ..Outcome::default()
            })
        }

        Request::AddNode => {
            let name = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("ADD_NODE: missing name argument".into()))?;
            let fingerprint = args.get(1).map(String::as_str).unwrap_or("");
            registry.add_node(name, fingerprint);
            Ok(Outcome {
                rebroadcast: Some(raw_line.to_vec()),
                ..Outcome::default()
            })
        }

        Request::DelNode => {
            let name = args
                .first()
                .ok_or_else(|| DaemonError::Protocol("DEL_NODE: missing name argument".into()))?;
            registry.del_node(name);
            Ok(Outcome {
                rebroadcast: Some(raw_line.to_vec()),
                ..Outcome::default()
            })
        }

        Request::KeyChanged => Ok(Outcome {
            rebroadcast: Some(raw_line.to_vec()),
            ..Outcome::default()
        }),

        Request::ReqKey | Request::AnsKey | Request::Packet | Request::Status | Request::Error => {
            Ok(Outcome::default())
        }
    }
}

/// Whether `request`'s successful handling should fan `raw_line` out to every other
/// active connection except the one it arrived on (§4.5, §8 invariant 3).
pub fn should_rebroadcast(request: Request) -> bool {
    request.is_broadcast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaceholderCipher;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1)
    }

    #[test]
    fn extract_lines_splits_and_keeps_tail() {
        let (lines, tail) = extract_lines(b"0 alpha\n1 deadbeef\npartial").unwrap();
        assert_eq!(lines, vec![b"0 alpha".to_vec(), b"1 deadbeef".to_vec()]);
        assert_eq!(tail, b"partial".to_vec());
    }

    #[test]
    fn extract_lines_rejects_oversized_line() {
        let huge = vec![b'a'; MAX_LINE_LEN + 10];
        let mut input = huge.clone();
        input.push(b'\n');
        let err = extract_lines(&input).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }

    #[test]
    fn extract_lines_rejects_embedded_nul() {
        let err = extract_lines(b"0 al\0pha\n").unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }

    #[test]
    fn parse_line_rejects_unknown_code() {
        let err = parse_line(b"999 foo").unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }

    #[test]
    fn request_below_minimum_state_is_rejected() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        let cipher = PlaceholderCipher;

        let err = handle_line(b"10 a 10.0.0.0/8", conn_id, &mut ctx, &mut registry, &cipher, "self")
            .unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }

    #[test]
    fn full_handshake_reaches_active_state() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        let cipher = PlaceholderCipher;

        let out = handle_line(b"0 peer", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert_eq!(ctx.state, HandshakeState::AwaitMetaKey);
        assert!(!out.reply.is_empty());

        let sealed = cipher.seal_with_identity("peer", b"0123456789abcdef0123456789abcdef").unwrap();
        let line = format!("1 {}", String::from_utf8_lossy(&sealed));
        let out = handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert_eq!(ctx.state, HandshakeState::AwaitChallenge);

        let (_, args) = parse_line(&out.reply).unwrap();
        let challenge_hex = args[0].clone();
        let line = format!("2 {challenge_hex}");
        let out = handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert_eq!(ctx.state, HandshakeState::AwaitChalReply);

        let (_, args) = parse_line(&out.reply).unwrap();
        let reply_hex = args[0].clone();
        let line = format!("3 {reply_hex}");
        let out = handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert_eq!(ctx.state, HandshakeState::Active);
        assert!(registry.get(conn_id).unwrap().flags.authenticated);
        assert!(!out.close);
    }

    #[test]
    fn add_subnet_marks_rebroadcast() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        ctx.state = HandshakeState::Active;
        let cipher = PlaceholderCipher;

        let out = handle_line(
            b"10 peer 10.1.0.0/16",
            conn_id,
            &mut ctx,
            &mut registry,
            &cipher,
            "self",
        )
        .unwrap();
        assert!(out.rebroadcast.is_some());
    }

    #[test]
    fn termreq_closes_connection() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        ctx.state = HandshakeState::Active;
        let cipher = PlaceholderCipher;

        let out = handle_line(b"7", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert!(out.close);
    }

    #[test]
    fn add_node_creates_topology_node_and_rebroadcasts() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        ctx.state = HandshakeState::Active;
        let cipher = PlaceholderCipher;

        let out = handle_line(b"18 gamma deadbeef", conn_id, &mut ctx, &mut registry, &cipher, "self")
            .unwrap();
        assert!(out.rebroadcast.is_some());
        let (_, node) = registry.node_by_name("gamma").unwrap();
        assert_eq!(node.fingerprint, "deadbeef");
    }

    #[test]
    fn del_node_removes_topology_node() {
        let mut registry = Registry::new("self", "fp");
        registry.add_node("gamma", "deadbeef");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        ctx.state = HandshakeState::Active;
        let cipher = PlaceholderCipher;

        let out = handle_line(b"19 gamma", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        assert!(out.rebroadcast.is_some());
        assert!(registry.node_by_name("gamma").is_none());
    }

    #[test]
    fn id_rejects_peer_with_newer_protocol_version() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        let cipher = PlaceholderCipher;

        let line = format!("0 peer {} 0", PROTOCOL_VERSION + 1);
        let err = handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self")
            .unwrap_err();
        assert!(matches!(err, DaemonError::IncompatibleVersion { .. }));
    }

    #[test]
    fn id_records_peer_version_and_options() {
        let mut registry = Registry::new("self", "fp");
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        let cipher = PlaceholderCipher;

        handle_line(b"0 peer 1 7", conn_id, &mut ctx, &mut registry, &cipher, "self").unwrap();
        let conn = registry.get(conn_id).unwrap();
        assert_eq!(conn.peer_version, Some(1));
        assert_eq!(conn.options, 7);
    }

    #[test]
    fn authentication_dumps_known_topology_to_new_peer() {
        let mut registry = Registry::new("self", "fp");
        let known = registry.add_node("known-peer", "fp2");
        registry
            .add_subnet(known, "10.2.0.0/16".parse().unwrap())
            .unwrap();
        let conn_id = registry
            .insert(crate::registry::Connection::new("peer".into(), addr(), false))
            .unwrap();
        let mut ctx = HandshakeCtx::new(false);
        ctx.state = HandshakeState::AwaitChalReply;
        let cipher = PlaceholderCipher;
        let nonce = b"0123456789abcdef";
        ctx.expected_digest = Some(cipher.digest(nonce));

        let digest_hex = hex::encode(cipher.digest(nonce));
        let line = format!("3 {digest_hex}");
        let out = handle_line(line.as_bytes(), conn_id, &mut ctx, &mut registry, &cipher, "self")
            .unwrap();
        let text = String::from_utf8(out.reply).unwrap();
        assert!(text.contains("known-peer"));
        assert!(text.contains("10.2.0.0/16"));
    }
}
