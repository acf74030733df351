// SPDX-License-Identifier: MIT

//! The connection registry and topology graph (C4, §4.4). Follows the arena strategy
//! of §9's "Pointer graphs" redesign note: nodes, edges and connections live in
//! slab-style arenas addressed by stable integer indices; `nexthop` and edge
//! endpoints are `Option<index>`/`index` values re-validated against the arena on
//! use rather than raw pointers or reference-counted cycles.

use crate::config::SubnetClaim;
use crate::error::DaemonError;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

/// Stable index into the connection arena. Never reused while the `Connection` it
/// named is still logically alive (the arena slot is cleared, not recycled, on
/// removal — see the comment on `remove`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(usize);

/// Stable index into the topology-node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Per-connection protocol status bits (§3 `Connection` attributes).
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnFlags {
    pub active: bool,
    pub authenticated: bool,
    pub pinged: bool,
    pub outgoing_initiated: bool,
    pub termreq_sent: bool,
}

/// One adjacent meta-peer (§3 `Connection`). Socket I/O, cipher context handles, and
/// line buffers are owned here but modeled loosely (`Vec<u8>` buffers) since the
/// actual non-blocking socket is owned by C7's mio registration, not this struct;
/// the registry is the authoritative *table*, not the I/O driver.
pub struct Connection {
    pub remote_name: String,
    pub remote_addr: SocketAddr,
    pub flags: ConnFlags,
    pub inbound_buf: Vec<u8>,
    pub outbound_queue: Vec<u8>,
    pub expected_response: Option<u32>,
    pub last_activity: Instant,
    pub peer_version: Option<u32>,
    pub options: u32,
}

impl Connection {
    pub fn new(remote_name: String, remote_addr: SocketAddr, outgoing: bool) -> Self {
        Connection {
            remote_name,
            remote_addr,
            flags: ConnFlags {
                outgoing_initiated: outgoing,
                ..ConnFlags::default()
            },
            inbound_buf: Vec::new(),
            outbound_queue: Vec::new(),
            expected_response: None,
            last_activity: Instant::now(),
            peer_version: None,
            options: 0,
        }
    }
}

/// A reachable VPN participant (§3 `TopologyNode`), possibly non-adjacent.
#[derive(Clone)]
pub struct TopologyNode {
    pub name: String,
    pub fingerprint: String,
    pub subnets: Vec<SubnetClaim>,
    pub udp_addr: Option<SocketAddr>,
    pub nexthop: Option<ConnId>,
    pub counters: NodeCounters,
}

/// The eight cumulative byte/packet counters of §3.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeCounters {
    pub in_packets_tap: u64,
    pub in_bytes_tap: u64,
    pub out_packets_tap: u64,
    pub out_bytes_tap: u64,
    pub in_packets_socket: u64,
    pub in_bytes_socket: u64,
    pub out_packets_socket: u64,
    pub out_bytes_socket: u64,
}

/// A directed meta-adjacency (§3 `Edge`).
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: u32,
    pub options: u32,
}

/// Owns the connection table and the topology graph learned from it (§4.4).
pub struct Registry {
    self_node: NodeId,
    connections: Vec<Option<Connection>>,
    conn_by_name: HashMap<String, ConnId>,
    nodes: Vec<Option<TopologyNode>>,
    node_by_name: HashMap<String, NodeId>,
    edges: Vec<Edge>,
}

impl Registry {
    /// Creates a registry with one `TopologyNode` for ourselves (always node 0);
    /// invariant 3 in §3 only constrains *non-self* nodes, so self never needs a
    /// `nexthop`.
    pub fn new(self_name: &str, self_fingerprint: &str) -> Self {
        let self_node = TopologyNode {
            name: self_name.to_string(),
            fingerprint: self_fingerprint.to_string(),
            subnets: Vec::new(),
            udp_addr: None,
            nexthop: None,
            counters: NodeCounters::default(),
        };
        let mut node_by_name = HashMap::new();
        node_by_name.insert(self_name.to_string(), NodeId(0));
        Registry {
            self_node: NodeId(0),
            connections: Vec::new(),
            conn_by_name: HashMap::new(),
            nodes: vec![Some(self_node)],
            node_by_name,
            edges: Vec::new(),
        }
    }

    pub fn self_node_id(&self) -> NodeId {
        self.self_node
    }

    // ---- connections -----------------------------------------------------

    /// Inserts `conn`, failing with `Duplicate` if the name is already taken
    /// (invariant 1 in §3).
    pub fn insert(&mut self, conn: Connection) -> Result<ConnId, DaemonError> {
        if self.conn_by_name.contains_key(&conn.remote_name) {
            return Err(DaemonError::Duplicate(format!(
                "connection to {} already exists",
                conn.remote_name
            )));
        }
        let name = conn.remote_name.clone();
        let id = ConnId(self.connections.len());
        self.connections.push(Some(conn));
        self.conn_by_name.insert(name, id);
        Ok(id)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<(ConnId, &Connection)> {
        let id = *self.conn_by_name.get(name)?;
        self.connections[id.0].as_ref().map(|c| (id, c))
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id.0).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0).and_then(|c| c.as_mut())
    }

    /// Every live connection, in arena order (used for admin dumps, §4.6).
    pub fn scan(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (ConnId(i), c)))
    }

    /// Removes `id`: clears the arena slot (cipher contexts / socket ownership live
    /// outside the registry in C7 and are torn down by the caller), then recomputes
    /// `nexthop` for every node since some may have been reachable only through this
    /// connection.
    pub fn remove(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(id.0).and_then(|c| c.take()) {
            self.conn_by_name.remove(&conn.remote_name);
        }
        self.recompute_nexthops();
    }

    /// Fans `line` out to every other **active** connection (§4.4, invariant 3 in
    /// §8: origin suppression).
    pub fn broadcast_except(&mut self, origin: ConnId, line: &[u8]) {
        for (id, conn) in self
            .connections
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| c.as_mut().map(|c| (ConnId(i), c)))
        {
            if id == origin || !conn.flags.active {
                continue;
            }
            conn.outbound_queue.extend_from_slice(line);
        }
    }

    // ---- topology ----------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&TopologyNode> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TopologyNode> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    pub fn node_by_name(&self, name: &str) -> Option<(NodeId, &TopologyNode)> {
        let id = *self.node_by_name.get(name)?;
        self.nodes[id.0].as_ref().map(|n| (id, n))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TopologyNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    /// `ADD_NODE`: idempotent, per §4.4 — adding an already-present node is a no-op.
    pub fn add_node(&mut self, name: &str, fingerprint: &str) -> NodeId {
        if let Some(&id) = self.node_by_name.get(name) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(TopologyNode {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            subnets: Vec::new(),
            udp_addr: None,
            nexthop: None,
            counters: NodeCounters::default(),
        }));
        self.node_by_name.insert(name.to_string(), id);
        id
    }

    /// `DEL_NODE`: idempotent — deleting an absent node is a no-op, logged at debug
    /// (§4.4). Removes any edges touching the node and recomputes `nexthop`.
    pub fn del_node(&mut self, name: &str) {
        let Some(&id) = self.node_by_name.get(name) else {
            tracing::debug!(node = name, "DEL_NODE for unknown node, ignoring");
            return;
        };
        self.node_by_name.remove(name);
        self.nodes[id.0] = None;
        self.edges.retain(|e| e.from != id && e.to != id);
        self.recompute_nexthops();
    }

    /// `ADD_SUBNET`: fails with `Duplicate` (triggering disconnection of the later
    /// claimant, per §3 Subnet invariant) if the prefix overlaps one already owned
    /// by a different node. Idempotent if the claim is already owned by `owner`.
    pub fn add_subnet(&mut self, owner: NodeId, subnet: SubnetClaim) -> Result<(), DaemonError> {
        for (id, node) in self.nodes() {
            if node.subnets.contains(&subnet) {
                if id == owner {
                    return Ok(());
                }
                return Err(DaemonError::Duplicate(format!(
                    "subnet {subnet} already claimed by {}",
                    node.name
                )));
            }
            if id != owner && overlaps(&node.subnets, &subnet) {
                return Err(DaemonError::Duplicate(format!(
                    "subnet {subnet} overlaps a claim by {}",
                    node.name
                )));
            }
        }
        if let Some(node) = self.nodes[owner.0].as_mut() {
            node.subnets.push(subnet);
        }
        Ok(())
    }

    /// `DEL_SUBNET`: idempotent — absent subnet is a no-op.
    pub fn del_subnet(&mut self, owner: NodeId, subnet: &SubnetClaim) {
        if let Some(node) = self.nodes[owner.0].as_mut() {
            node.subnets.retain(|s| s != subnet);
        }
    }

    /// `ADD_EDGE`: idempotent on an identical edge; a re-announcement with a new
    /// weight replaces the old one (last-writer-wins, §4.5 broadcast rule rationale).
    /// Always recomputes `nexthop`.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, weight: u32, options: u32) {
        if let Some(e) = self.edges.iter_mut().find(|e| e.from == from && e.to == to) {
            e.weight = weight;
            e.options = options;
        } else {
            self.edges.push(Edge {
                from,
                to,
                weight,
                options,
            });
        }
        self.recompute_nexthops();
    }

    /// `DEL_EDGE`: idempotent — absent edge is a no-op.
    pub fn del_edge(&mut self, from: NodeId, to: NodeId) {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.from == from && e.to == to));
        if self.edges.len() != before {
            self.recompute_nexthops();
        }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Recomputes `nexthop` for every non-self node by BFS from self over active,
    /// authenticated connections, breaking ties by ascending peer name (§4.4).
    ///
    /// An edge `self -> X` is only usable as a first hop if there's a live,
    /// authenticated `Connection` named `X`; after that, edges are followed purely
    /// topologically (store-and-forward reachability), matching the source's
    /// behavior of trusting the learned edge set rather than re-verifying liveness
    /// at every hop.
    fn recompute_nexthops(&mut self) {
        let self_id = self.self_node;
        let mut nexthop: HashMap<NodeId, ConnId> = HashMap::new();
        let mut visited: HashMap<NodeId, ()> = HashMap::new();
        visited.insert(self_id, ());

        // Seed the frontier with direct, authenticated neighbors in ascending name
        // order so that when two first hops are otherwise equal, the lexicographically
        // smaller peer name wins (tie-break rule in §4.4).
        let mut direct: Vec<(&str, ConnId)> = self
            .scan()
            .filter(|(_, c)| c.flags.active && c.flags.authenticated)
            .map(|(id, c)| (c.remote_name.as_str(), id))
            .collect();
        direct.sort_by(|a, b| a.0.cmp(b.0));

        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for (name, conn_id) in direct {
            if let Some((node_id, _)) = self.node_by_name(name) {
                if !visited.contains_key(&node_id) {
                    visited.insert(node_id, ());
                    nexthop.insert(node_id, conn_id);
                    queue.push_back(node_id);
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            let hop = nexthop[&current];
            let mut next: Vec<NodeId> = self
                .edges
                .iter()
                .filter(|e| e.from == current)
                .map(|e| e.to)
                .collect();
            next.sort_by_key(|n| self.node(*n).map(|n| n.name.clone()).unwrap_or_default());
            for to in next {
                if !visited.contains_key(&to) {
                    visited.insert(to, ());
                    nexthop.insert(to, hop);
                    queue.push_back(to);
                }
            }
        }

        for (id, node) in self
            .nodes
            .iter_mut()
            .enumerate()
            .filter_map(|(i, n)| n.as_mut().map(|n| (NodeId(i), n)))
        {
            node.nexthop = if id == self_id {
                None
            } else {
                nexthop.get(&id).copied()
            };
        }
    }
}

fn overlaps(existing: &[SubnetClaim], candidate: &SubnetClaim) -> bool {
    existing.iter().any(|s| subnets_overlap(s, candidate))
}

fn subnets_overlap(a: &SubnetClaim, b: &SubnetClaim) -> bool {
    use std::net::IpAddr;
    let (IpAddr::V4(a_addr), IpAddr::V4(b_addr)) = (a.address, b.address) else {
        return a.address == b.address && a.prefix_len == b.prefix_len;
    };
    let prefix_len = a.prefix_len.min(b.prefix_len);
    let mask = if prefix_len == 0 {
        0u32
    } else {
        u32::MAX << (32 - prefix_len)
    };
    (u32::from(a_addr) & mask) == (u32::from(b_addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn subnet(s: &str) -> SubnetClaim {
        s.parse().unwrap()
    }

    #[test]
    fn duplicate_connection_name_is_rejected() {
        let mut reg = Registry::new("self", "fp");
        reg.insert(Connection::new("alpha".into(), addr(1), true)).unwrap();
        let err = reg
            .insert(Connection::new("alpha".into(), addr(2), false))
            .unwrap_err();
        assert!(matches!(err, DaemonError::Duplicate(_)));
    }

    #[test]
    fn broadcast_suppresses_origin() {
        let mut reg = Registry::new("self", "fp");
        let a = reg.insert(Connection::new("a".into(), addr(1), true)).unwrap();
        let b = reg.insert(Connection::new("b".into(), addr(2), true)).unwrap();
        reg.get_mut(a).unwrap().flags.active = true;
        reg.get_mut(b).unwrap().flags.active = true;

        reg.broadcast_except(a, b"ADD_SUBNET X 10.1.0.0/16\n");

        assert!(reg.get(a).unwrap().outbound_queue.is_empty());
        assert_eq!(reg.get(b).unwrap().outbound_queue, b"ADD_SUBNET X 10.1.0.0/16\n");
    }

    #[test]
    fn overlapping_subnets_rejected_disjoint_accepted() {
        let mut reg = Registry::new("self", "fp");
        let x = reg.add_node("x", "fpx");
        let y = reg.add_node("y", "fpy");
        reg.add_subnet(x, subnet("10.1.0.0/16")).unwrap();

        let err = reg.add_subnet(y, subnet("10.1.5.0/24")).unwrap_err();
        assert!(matches!(err, DaemonError::Duplicate(_)));

        reg.add_subnet(y, subnet("10.2.0.0/16")).unwrap();
        assert_eq!(reg.node(y).unwrap().subnets.len(), 1);
    }

    #[test]
    fn add_subnet_is_idempotent_for_same_owner() {
        let mut reg = Registry::new("self", "fp");
        let x = reg.add_node("x", "fpx");
        reg.add_subnet(x, subnet("10.1.0.0/16")).unwrap();
        reg.add_subnet(x, subnet("10.1.0.0/16")).unwrap();
        assert_eq!(reg.node(x).unwrap().subnets.len(), 1);
    }

    #[test]
    fn add_then_del_subnet_round_trips() {
        let mut reg = Registry::new("self", "fp");
        let x = reg.add_node("x", "fpx");
        let s = subnet("10.1.0.0/16");
        reg.add_subnet(x, s.clone()).unwrap();
        reg.del_subnet(x, &s);
        assert!(reg.node(x).unwrap().subnets.is_empty());
    }

    #[test]
    fn add_edge_twice_yields_one_edge() {
        let mut reg = Registry::new("self", "fp");
        let a = reg.add_node("a", "fpa");
        let b = reg.add_node("b", "fpb");
        reg.add_edge(a, b, 1, 0);
        reg.add_edge(a, b, 1, 0);
        assert_eq!(reg.edges().len(), 1);
    }

    #[test]
    fn del_absent_edge_is_noop() {
        let mut reg = Registry::new("self", "fp");
        let a = reg.add_node("a", "fpa");
        let b = reg.add_node("b", "fpb");
        reg.del_edge(a, b);
        assert!(reg.edges().is_empty());
    }

    #[test]
    fn nexthop_recomputed_via_bfs_over_direct_connections() {
        let mut reg = Registry::new("self", "fp");
        let b = reg.insert(Connection::new("b".into(), addr(1), true)).unwrap();
        reg.get_mut(b).unwrap().flags.active = true;
        reg.get_mut(b).unwrap().flags.authenticated = true;

        let self_id = reg.self_node_id();
        let b_node = reg.add_node("b", "fpb");
        let c_node = reg.add_node("c", "fpc");
        reg.add_edge(self_id, b_node, 1, 0);
        reg.add_edge(b_node, c_node, 1, 0);

        assert_eq!(reg.node(b_node).unwrap().nexthop, Some(b));
        assert_eq!(reg.node(c_node).unwrap().nexthop, Some(b));
    }

    #[test]
    fn removing_connection_purges_nexthops_through_it() {
        let mut reg = Registry::new("self", "fp");
        let b = reg.insert(Connection::new("b".into(), addr(1), true)).unwrap();
        reg.get_mut(b).unwrap().flags.active = true;
        reg.get_mut(b).unwrap().flags.authenticated = true;

        let self_id = reg.self_node_id();
        let b_node = reg.add_node("b", "fpb");
        reg.add_edge(self_id, b_node, 1, 0);
        assert_eq!(reg.node(b_node).unwrap().nexthop, Some(b));

        reg.remove(b);
        assert_eq!(reg.node(b_node).unwrap().nexthop, None);
    }

    #[test]
    fn ipv4_subnet_overlap_detection() {
        assert!(subnets_overlap(&subnet("10.0.0.0/8"), &subnet("10.1.2.0/24")));
        assert!(!subnets_overlap(&subnet("10.0.0.0/8"), &subnet("11.0.0.0/8")));
    }
}
