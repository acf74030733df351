// SPDX-License-Identifier: MIT

//! The main loop (C7, §4.7): a single-threaded `mio` multiplexer over the meta
//! listener, established meta connections, the control listener and its clients,
//! and the signal source. Nothing here blocks; every wait happens in one
//! `Poll::poll` call per iteration.

use crate::config::Config;
use crate::control::{self, ControlCommand, ControlListener};
use crate::crypto::CipherSuite;
use crate::dataplane::DataPlane;
use crate::error::DaemonError;
use crate::meta::{self, HandshakeCtx};
use crate::names::{self, NetIdentity};
use crate::registry::{ConnId, Connection, Registry};
use crate::signals::SignalSource;
use crate::state::DaemonState;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

const TOKEN_META_LISTENER: Token = Token(0);
const TOKEN_CONTROL_LISTENER: Token = Token(1);
const TOKEN_SIGNALS: Token = Token(2);
/// Tokens below this are reserved for the fixed sources above; meta connections and
/// control clients are allocated tokens starting here.
const TOKEN_DYNAMIC_BASE: usize = 16;

const IDLE_POLL_CAP: Duration = Duration::from_secs(1);

/// Exponential reconnect backoff for outgoing connections (§4.7, §4.5): starts at 5s,
/// doubles on each consecutive failure, caps at 300s. Resets on a successful
/// handshake.
pub struct Backoff {
    current: Duration,
    next_attempt: Instant,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(300);

    pub fn new() -> Self {
        Backoff {
            current: Self::INITIAL,
            next_attempt: Instant::now(),
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_attempt.saturating_duration_since(now)
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.next_attempt = now + self.current;
        self.current = (self.current * 2).min(Self::CAP);
    }

    pub fn on_success(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

struct MetaConn {
    stream: TcpStream,
    conn_id: ConnId,
    ctx: HandshakeCtx,
    read_buf: Vec<u8>,
    partial_line: Vec<u8>,
}

struct ControlClient {
    stream: UnixStream,
    authenticated_pid: i32,
}

/// Owns every mio-registered source and drives the select/dispatch cycle (§4.7).
pub struct MainLoop {
    poll: Poll,
    events: Events,
    meta_listener: TcpListener,
    control_listener: ControlListener,
    signals: SignalSource,
    registry: Registry,
    state: DaemonState,
    cipher: Box<dyn CipherSuite>,
    dataplane: Box<dyn DataPlane>,
    config: Config,
    meta_conns: HashMap<Token, MetaConn>,
    control_clients: HashMap<Token, ControlClient>,
    next_token: usize,
    self_name: String,
    identity: NetIdentity,
    reconnects: HashMap<String, Backoff>,
    last_key_rotation: Instant,
}

impl MainLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_name: String,
        config: Config,
        identity: NetIdentity,
        control_socket_path: std::path::PathBuf,
        cipher: Box<dyn CipherSuite>,
        mut dataplane: Box<dyn DataPlane>,
        state: DaemonState,
    ) -> Result<MainLoop, DaemonError> {
        let poll = Poll::new()?;

        let addr = format!("0.0.0.0:{}", config.listen_port)
            .parse()
            .map_err(|_| DaemonError::Config("invalid listen port".into()))?;
        let mut meta_listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut meta_listener, TOKEN_META_LISTENER, Interest::READABLE)?;

        let control_listener = ControlListener::bind(&control_socket_path)?;
        let control_fd = control_listener.as_raw_fd();
        poll.registry().register(
            &mut SourceFd(&control_fd),
            TOKEN_CONTROL_LISTENER,
            Interest::READABLE,
        )?;

        let mut signals = SignalSource::new()?;
        signals.register(poll.registry(), TOKEN_SIGNALS)?;

        dataplane.up(&config)?;

        let registry = Registry::new(&self_name, "");

        Ok(MainLoop {
            poll,
            events: Events::with_capacity(128),
            meta_listener,
            control_listener,
            signals,
            registry,
            state,
            cipher,
            dataplane,
            config,
            meta_conns: HashMap::new(),
            control_clients: HashMap::new(),
            next_token: TOKEN_DYNAMIC_BASE,
            self_name,
            identity,
            reconnects: HashMap::new(),
            last_key_rotation: Instant::now(),
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Runs until a shutdown signal is received or `run_once` is told to stop
    /// externally (used by tests to single-step).
    pub fn run(&mut self) -> Result<(), DaemonError> {
        while self.state.running {
            self.run_once()?;
        }
        self.shutdown();
        Ok(())
    }

    /// One iteration: compute the timeout, poll, and dispatch. Public so tests and
    /// a hypothetical supervisor can drive the loop deterministically.
    pub fn run_once(&mut self) -> Result<(), DaemonError> {
        let timeout = self.next_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            match token {
                TOKEN_META_LISTENER => self.accept_meta()?,
                TOKEN_CONTROL_LISTENER => self.accept_control()?,
                TOKEN_SIGNALS => self.handle_signals()?,
                t if self.meta_conns.contains_key(&t) => self.readable_meta(t),
                t if self.control_clients.contains_key(&t) => self.readable_control(t),
                _ => {}
            }
        }

        self.run_timers();
        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut min = IDLE_POLL_CAP;
        for backoff in self.reconnects.values() {
            min = min.min(backoff.remaining(now));
        }
        min
    }

    fn accept_meta(&mut self) -> Result<(), DaemonError> {
        loop {
            match self.meta_listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    let placeholder_name = format!("unverified-{}", token.0);
                    let conn_id = self
                        .registry
                        .insert(Connection::new(placeholder_name, peer_addr, false))?;
                    self.meta_conns.insert(
                        token,
                        MetaConn {
                            stream,
                            conn_id,
                            ctx: HandshakeCtx::new(false),
                            read_buf: Vec::new(),
                            partial_line: Vec::new(),
                        },
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn accept_control(&mut self) -> Result<(), DaemonError> {
        loop {
            match self.control_listener.accept() {
                Ok(Some((mut stream, pid))) => {
                    let token = self.alloc_token();
                    let fd = stream.as_raw_fd();
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
                    let _ = stream.write_all(control::greeting(pid.as_raw()).as_bytes());
                    self.control_clients.insert(
                        token,
                        ControlClient {
                            stream,
                            authenticated_pid: pid.as_raw(),
                        },
                    );
                }
                Ok(None) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn handle_signals(&mut self) -> Result<(), DaemonError> {
        let events = self.signals.drain();
        if events.shutdown_requested() {
            self.state.request_shutdown();
        }
        if events.hup {
            tracing::info!("SIGHUP received, reloading configuration");
            self.reload_config();
        }
        if events.usr1 {
            let nodes = control::render_dump(&ControlCommand::DumpNodes, &self.registry);
            let edges = control::render_dump(&ControlCommand::DumpEdges, &self.registry);
            let subnets = control::render_dump(&ControlCommand::DumpSubnets, &self.registry);
            tracing::event!(
                target: "notice",
                tracing::Level::INFO,
                "topology dump:\n{nodes}{edges}{subnets}"
            );
        }
        if events.usr2 {
            tracing::info!("key regeneration requested");
            self.last_key_rotation = Instant::now();
        }
        if events.chld {
            // Script subprocess reaping lives in the data-plane collaborator; the
            // core only needs to know a child exited so it doesn't leak zombies.
            unsafe {
                while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
            }
        }
        Ok(())
    }

    fn readable_meta(&mut self, token: Token) {
        match self.pump_meta(token) {
            Ok(true) => self.close_meta(token),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "meta connection error, closing");
                self.close_meta(token);
            }
        }
    }

    /// Reads and dispatches as many lines as are available on `token`'s socket.
    /// Returns whether the connection should be closed (peer EOF or `TERMREQ`).
    fn pump_meta(&mut self, token: Token) -> Result<bool, DaemonError> {
        let conn = self.meta_conns.get_mut(&token).expect("token present");
        let mut chunk = [0u8; 4096];
        let n = match conn.stream.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        conn.read_buf.extend_from_slice(&chunk[..n]);
        let mut buf = std::mem::take(&mut conn.partial_line);
        buf.extend_from_slice(&conn.read_buf);
        conn.read_buf.clear();
        let (lines, tail) = meta::extract_lines(&buf)?;
        conn.partial_line = tail;
        let conn_id = conn.conn_id;

        let mut close = false;
        let mut replies = Vec::new();
        let mut rebroadcasts = Vec::new();
        for line in &lines {
            let conn = self.meta_conns.get_mut(&token).expect("token present");
            let outcome = meta::handle_line(
                line,
                conn_id,
                &mut conn.ctx,
                &mut self.registry,
                self.cipher.as_ref(),
                &self.self_name,
            )?;
            if !outcome.reply.is_empty() {
                replies.push(outcome.reply);
            }
            if let Some(line) = outcome.rebroadcast {
                rebroadcasts.push(line);
            }
            if outcome.close {
                close = true;
                break;
            }
        }

        let conn = self.meta_conns.get_mut(&token).expect("token present");
        for reply in replies {
            let _ = conn.stream.write_all(&reply);
        }
        for line in rebroadcasts {
            self.registry.broadcast_except(conn_id, &line);
        }
        Ok(close)
    }

    fn close_meta(&mut self, token: Token) {
        if let Some(mut conn) = self.meta_conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.registry.remove(conn.conn_id);
        }
    }

    fn readable_control(&mut self, token: Token) {
        let result = (|| -> std::io::Result<Option<String>> {
            let client = self.control_clients.get_mut(&token).expect("token present");
            let mut chunk = [0u8; 4096];
            let n = client.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            Ok(Some(String::from_utf8_lossy(&chunk[..n]).trim().to_string()))
        })();

        let Ok(Some(line)) = result else {
            self.close_control(token);
            return;
        };

        let command = match ControlCommand::parse(&line) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, pid = self.control_clients[&token].authenticated_pid, "bad control command");
                self.close_control(token);
                return;
            }
        };

        match &command {
            ControlCommand::Stop => self.state.request_shutdown(),
            ControlCommand::Reload => self.reload_config(),
            ControlCommand::SetDebug(level) => self.state.debug_level = *level,
            ControlCommand::Purge => self.reconnects.clear(),
            ControlCommand::Retry => {
                for backoff in self.reconnects.values_mut() {
                    *backoff = Backoff::new();
                }
            }
            ControlCommand::DumpTraffic => {
                self.sync_self_counters();
                let response = control::render_traffic_dump(&self.registry);
                if let Some(client) = self.control_clients.get_mut(&token) {
                    let _ = client.stream.write_all(response.as_bytes());
                }
            }
            ControlCommand::DumpNodes
            | ControlCommand::DumpEdges
            | ControlCommand::DumpSubnets
            | ControlCommand::DumpConnections => {
                let response = control::render_dump(&command, &self.registry);
                if let Some(client) = self.control_clients.get_mut(&token) {
                    let _ = client.stream.write_all(response.as_bytes());
                }
            }
        }
    }

    fn reload_config(&mut self) {
        match Config::load(&self.identity.config_base_dir(), self.config.net_name.clone()) {
            Ok(cfg) => self.config = cfg,
            Err(e) => tracing::warn!(error = %e, "configuration reload failed, keeping old configuration"),
        }
    }

    fn close_control(&mut self, token: Token) {
        if let Some(client) = self.control_clients.remove(&token) {
            let fd = client.stream.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    fn run_timers(&mut self) {
        self.maintain_outgoing_connections();

        let now = Instant::now();
        let ping_timeout = self.config.ping_interval;
        let mut timed_out = Vec::new();
        for (token, conn) in self.meta_conns.iter_mut() {
            if conn.ctx.state != meta::HandshakeState::Active {
                continue;
            }
            let idle = conn
                .ctx
                .last_ping_sent
                .map(|t| now.duration_since(t))
                .unwrap_or(Duration::MAX);
            if conn.ctx.waiting_for_pong
                && idle > ping_timeout + meta::PING_GRACE
            {
                timed_out.push(*token);
            } else if !conn.ctx.waiting_for_pong && idle >= ping_timeout {
                let _ = conn.stream.write_all(b"8\n");
                conn.ctx.last_ping_sent = Some(now);
                conn.ctx.waiting_for_pong = true;
            }
        }
        for token in timed_out {
            let err = DaemonError::Timeout("no PONG within the ping grace period".into());
            tracing::warn!(error = %err, "closing connection after ping timeout");
            self.close_meta(token);
        }

        if now.duration_since(self.last_key_rotation) >= self.config.key_rotation_interval {
            tracing::info!("session key rotation interval elapsed");
            self.last_key_rotation = now;
        }
    }

    /// Drives the outgoing side of the mesh (§4.5 CONNECT -> ID_SENT, §4.7): for
    /// every configured host with an address we're not already connected to, retries
    /// a `TcpStream::connect` on its `Backoff` schedule. A host already present in
    /// the registry (reached either by dialing out or by accepting its inbound
    /// connection) is left alone.
    fn maintain_outgoing_connections(&mut self) {
        let now = Instant::now();
        let candidates: Vec<(String, String, u16)> = self
            .config
            .hosts
            .iter()
            .filter_map(|h| {
                let address = h.address.clone()?;
                let port = h.port.unwrap_or(self.config.listen_port);
                Some((h.name.clone(), address, port))
            })
            .collect();

        for (name, address, port) in candidates {
            if self.registry.lookup_by_name(&name).is_some() {
                self.reconnects.remove(&name);
                continue;
            }
            let due = self
                .reconnects
                .entry(name.clone())
                .or_insert_with(Backoff::new)
                .due(now);
            if !due {
                continue;
            }
            match self.connect_host(&name, &address, port) {
                Ok(()) => {
                    if let Some(backoff) = self.reconnects.get_mut(&name) {
                        backoff.on_success();
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %name, error = %e, "outgoing connection failed, will retry");
                    if let Some(backoff) = self.reconnects.get_mut(&name) {
                        backoff.on_failure(now);
                    }
                }
            }
        }
    }

    /// Opens one outgoing meta connection to `name` at `address:port`, registers it
    /// with the poll set, and sends the initial `ID` line (§4.5 CONNECT -> ID_SENT).
    fn connect_host(&mut self, name: &str, address: &str, port: u16) -> Result<(), DaemonError> {
        let sockaddr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| DaemonError::Config(format!("{name}: invalid address {address}:{port}")))?;
        let mut stream = TcpStream::connect(sockaddr)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        let conn_id = self
            .registry
            .insert(Connection::new(name.to_string(), sockaddr, true))?;
        let _ = stream.write_all(&meta::encode_id_line(&self.self_name));
        self.meta_conns.insert(
            token,
            MetaConn {
                stream,
                conn_id,
                ctx: HandshakeCtx::new(true),
                read_buf: Vec::new(),
                partial_line: Vec::new(),
            },
        );
        Ok(())
    }

    /// Copies the data plane's cumulative counters onto the self-node before a
    /// `DUMP_TRAFFIC` response is rendered, so the observer sees our own traffic
    /// alongside every peer's (§4.9: "for every known node").
    fn sync_self_counters(&mut self) {
        let c = self.dataplane.counters();
        let self_id = self.registry.self_node_id();
        if let Some(node) = self.registry.node_mut(self_id) {
            node.counters.in_packets_socket = c.in_packets;
            node.counters.in_bytes_socket = c.in_bytes;
            node.counters.out_packets_socket = c.out_packets;
            node.counters.out_bytes_socket = c.out_bytes;
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("shutting down");
        let tokens: Vec<Token> = self.meta_conns.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.meta_conns.get_mut(&token) {
                let _ = conn.stream.write_all(b"7\n");
            }
            self.close_meta(token);
        }
        self.dataplane.down();
        names::release_pid_lock(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new();
        let t0 = Instant::now();
        assert!(b.due(t0));
        b.on_failure(t0);
        assert!(!b.due(t0));
        assert_eq!(b.current, Duration::from_secs(10));
        for _ in 0..10 {
            b.on_failure(t0);
        }
        assert_eq!(b.current, Backoff::CAP);
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut b = Backoff::new();
        let t0 = Instant::now();
        b.on_failure(t0);
        b.on_failure(t0);
        b.on_success();
        assert_eq!(b.current, Backoff::INITIAL);
    }
}
