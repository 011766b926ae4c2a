//! Per-accepted-connection state machine and byte pump.
//!
//! A struct owning both endpoints of one relay, driven purely by
//! mutating methods invoked from the dispatcher, never blocking on
//! its own: stage transitions for CONNECT/UDP_ASSOCIATE dispatch, the
//! `write_to_sock`-style buffered send, and interest recomputation all
//! live here.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Buf, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slog::Logger;

use crate::cipher::StreamCipher;
use crate::resolver::Resolver;
use crate::server::HandlerId;
use crate::socks::{self, CONNECT_SUCCESS_REPLY};

const BUF_SIZE: usize = 8192;
/// Cap on `pending_to_*`: without it these buffers grow unbounded
/// against a persistently slow peer.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    Init = 0,
    Hello = 1,
    UdpAssoc = 2,
    Reply = 4,
    Stream = 5,
}

/// Bitmask status for one direction: bit 0 = reading, bit 1 = writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatus(u8);

impl IoStatus {
    pub const INIT: IoStatus = IoStatus(0);
    pub const READING: IoStatus = IoStatus(1);
    pub const WRITING: IoStatus = IoStatus(2);
    pub const READWRITING: IoStatus = IoStatus(3);

    fn has_reading(self) -> bool {
        self.0 & Self::READING.0 != 0
    }

    fn has_writing(self) -> bool {
        self.0 & Self::WRITING.0 != 0
    }
}

/// What the caller should do with a handler after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Destroyed,
}

/// Everything a handler needs from the outside world for one call,
/// but does not own itself — mirrors how `Connection` methods in
/// `connection.rs` take a `&mut Context` carrying the rng/config/log
/// the connection doesn't keep a copy of.
pub struct HandlerEnv<'a> {
    pub registry: &'a Registry,
    pub resolver: &'a dyn Resolver,
    /// Local role only: the configured remote relay instance's address,
    /// resolved once at startup (spec.md §4.2.2 — CONNECT dials the
    /// tunnel's far side, not the parsed destination).
    pub relay_addr: Option<SocketAddr>,
    pub timeout: u64,
}

pub struct Handler {
    id: HandlerId,
    is_local: bool,
    stage: Stage,
    local: TcpStream,
    remote: Option<TcpStream>,
    cipher: Box<dyn StreamCipher>,
    pending_to_local: BytesMut,
    pending_to_remote: BytesMut,
    upstream_status: IoStatus,
    downstream_status: IoStatus,
    local_registered: bool,
    remote_registered: bool,
    remote_address: Option<(String, u16)>,
    last_activity: u64,
    destroyed: bool,
    log: Logger,
}

fn token_for_fd(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl Handler {
    pub fn new(
        id: HandlerId,
        mut local: TcpStream,
        is_local: bool,
        cipher: Box<dyn StreamCipher>,
        now: u64,
        registry: &Registry,
        log: Logger,
    ) -> io::Result<Self> {
        local.set_nodelay(true)?;
        registry.register(&mut local, token_for_fd(local.as_raw_fd()), Interest::READABLE)?;
        Ok(Handler {
            id,
            is_local,
            stage: Stage::Init,
            local,
            remote: None,
            cipher,
            pending_to_local: BytesMut::new(),
            pending_to_remote: BytesMut::new(),
            upstream_status: IoStatus::READING,
            downstream_status: IoStatus::INIT,
            local_registered: true,
            remote_registered: false,
            remote_address: None,
            last_activity: now,
            destroyed: false,
            log,
        })
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    pub fn remote_address(&self) -> Option<&(String, u16)> {
        self.remote_address.as_ref()
    }

    pub fn local_fd(&self) -> RawFd {
        self.local.as_raw_fd()
    }

    pub fn remote_fd(&self) -> Option<RawFd> {
        self.remote.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
    }

    /// Idempotent teardown (spec.md §4.2.8): deregisters both sockets,
    /// drops them (closing the fds exactly once), and marks the
    /// handler dead so a second call is a no-op.
    pub fn destroy(&mut self, registry: &Registry, reason: &str) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let remote_desc = self
            .remote_address
            .as_ref()
            .map(|(h, p)| format!("{}:{}", h, p))
            .unwrap_or_else(|| "-".to_owned());
        slog::warn!(self.log, "destroying handler"; "reason" => reason, "remote" => remote_desc);
        let _ = registry.deregister(&mut self.local);
        if let Some(remote) = self.remote.as_mut() {
            let _ = registry.deregister(remote);
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn on_local_event(
        &mut self,
        readable: bool,
        writable: bool,
        env: &HandlerEnv,
    ) -> Progress {
        if readable && !self.destroyed {
            self.handle_local_readable(env);
        }
        if writable && !self.destroyed {
            self.flush_pending_to_local(env.registry);
        }
        self.outcome()
    }

    pub fn on_remote_event(
        &mut self,
        readable: bool,
        writable: bool,
        env: &HandlerEnv,
    ) -> Progress {
        if writable && !self.destroyed {
            if self.stage == Stage::Reply {
                self.complete_connect(env);
            } else {
                self.flush_pending_to_remote(env.registry);
            }
        }
        if readable && !self.destroyed {
            self.handle_remote_readable(env);
        }
        self.outcome()
    }

    fn outcome(&self) -> Progress {
        if self.destroyed {
            Progress::Destroyed
        } else {
            Progress::Continue
        }
    }

    fn handle_local_readable(&mut self, env: &HandlerEnv) {
        match self.stage {
            Stage::Init if self.is_local => self.handle_greeting(env),
            Stage::Init => self.handle_remote_role_init(env),
            Stage::Hello => self.handle_request(env),
            Stage::Reply => self.buffer_early_payload(env),
            Stage::UdpAssoc => self.drain_udp_assoc_control(env),
            Stage::Stream => self.pump_local_to_remote(env),
        }
    }

    fn handle_remote_readable(&mut self, env: &HandlerEnv) {
        if self.stage == Stage::Stream {
            self.pump_remote_to_local(env);
        }
    }

    fn recv_local(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.local.read(buf)
    }

    fn recv_remote(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.remote.as_mut().expect("remote socket not connected").read(buf)
    }

    fn handle_greeting(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_local(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "peer closed during greeting"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        if n < 2 {
            return self.destroy(env.registry, "truncated SOCKS5 greeting");
        }
        self.enqueue_to_local(&[0x05, socks::METHOD_NOAUTH], env);
        self.stage = Stage::Hello;
    }

    fn handle_request(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_local(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "peer closed during request"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        if n < 3 || buf[0] != socks::SOCKS5_VERSION {
            return self.destroy(env.registry, "malformed SOCKS5 request");
        }
        let cmd = buf[1];
        let rest = &buf[3..n];
        match cmd {
            socks::CMD_CONNECT => self.handle_connect(rest, env),
            socks::CMD_UDP_ASSOCIATE => self.handle_udp_associate(env),
            _ => self.destroy(env.registry, "unsupported SOCKS5 command"),
        }
    }

    fn handle_connect(&mut self, rest: &[u8], env: &HandlerEnv) {
        let (addr, _consumed) = match socks::parse_header(rest) {
            Some(v) => v,
            None => return self.destroy(env.registry, "unparseable address header"),
        };
        self.remote_address = Some((addr.host, addr.port));
        self.enqueue_to_local(&CONNECT_SUCCESS_REPLY, env);
        let encrypted = self.cipher.encrypt(rest);
        self.pending_to_remote.extend_from_slice(&encrypted);
        let target = match env.relay_addr {
            Some(a) => a,
            None => return self.destroy(env.registry, "no remote relay address configured"),
        };
        self.begin_connect(target, env);
    }

    fn handle_udp_associate(&mut self, env: &HandlerEnv) {
        let local_addr = match self.local.local_addr() {
            Ok(a) => a,
            Err(e) => return self.destroy(env.registry, &format!("local_addr failed: {}", e)),
        };
        let mut reply = Vec::with_capacity(22);
        reply.extend_from_slice(&[socks::SOCKS5_VERSION, 0x00, 0x00]);
        match local_addr {
            SocketAddr::V4(a) => {
                reply.push(socks::ATYP_IPV4);
                reply.extend_from_slice(&a.ip().octets());
            }
            SocketAddr::V6(a) => {
                reply.push(socks::ATYP_IPV6);
                reply.extend_from_slice(&a.ip().octets());
            }
        }
        let mut port_buf = [0u8; 2];
        BigEndian::write_u16(&mut port_buf, local_addr.port());
        reply.extend_from_slice(&port_buf);
        self.enqueue_to_local(&reply, env);
        self.stage = Stage::UdpAssoc;
    }

    fn drain_udp_assoc_control(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; 256];
        match self.local.read(&mut buf) {
            Ok(0) => self.destroy(env.registry, "UDP-ASSOCIATE control connection closed"),
            Ok(_) => {}
            Err(e) if would_block_or_benign(&e) => {}
            Err(e) => self.destroy(env.registry, &format!("control connection error: {}", e)),
        }
    }

    /// Remote role entry point: first decrypted bytes on `local`
    /// (the tunnel link) carry the address header (spec.md §4.2.3).
    fn handle_remote_role_init(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_local(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "tunnel peer closed before header"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        let decrypted = self.cipher.decrypt(&buf[..n]);
        if decrypted.is_empty() {
            return self.destroy(env.registry, "cipher failed to decode header");
        }
        let (addr, consumed) = match socks::parse_header(&decrypted) {
            Some(v) => v,
            None => return self.destroy(env.registry, "unparseable address header"),
        };
        let target = match env.resolver.resolve(&addr.host, addr.port) {
            Ok(a) => a,
            Err(e) => return self.destroy(env.registry, &format!("DNS resolution failed: {}", e)),
        };
        self.remote_address = Some((addr.host, addr.port));
        if decrypted.len() > consumed {
            self.pending_to_remote.extend_from_slice(&decrypted[consumed..]);
        }
        self.begin_connect(target, env);
    }

    fn buffer_early_payload(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_local(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "peer closed while connecting upstream"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        let payload = if self.is_local {
            self.cipher.encrypt(&buf[..n])
        } else {
            let out = self.cipher.decrypt(&buf[..n]);
            if out.is_empty() {
                return self.destroy(env.registry, "cipher failed to decode payload");
            }
            out
        };
        if self.pending_to_remote.len() + payload.len() > MAX_PENDING_BYTES {
            return self.destroy(env.registry, "pending-to-remote buffer overflowed");
        }
        self.pending_to_remote.extend_from_slice(&payload);
    }

    fn begin_connect(&mut self, target: SocketAddr, env: &HandlerEnv) {
        let mut remote = match TcpStream::connect(target) {
            Ok(s) => s,
            Err(e) => return self.destroy(env.registry, &format!("connect failed: {}", e)),
        };
        if let Err(e) = remote.set_nodelay(true) {
            return self.destroy(env.registry, &format!("set_nodelay failed: {}", e));
        }
        if let Err(e) =
            env.registry
                .register(&mut remote, token_for_fd(remote.as_raw_fd()), Interest::WRITABLE)
        {
            return self.destroy(env.registry, &format!("register failed: {}", e));
        }
        self.remote = Some(remote);
        self.remote_registered = true;
        self.stage = Stage::Reply;
        self.upstream_status = IoStatus::READWRITING;
        self.downstream_status = IoStatus::READING;
    }

    /// The remote socket's first writable event after `connect()` is
    /// the signal the connect completed, successfully or not
    /// (spec.md §4.2.4, §9 "event ordering").
    fn complete_connect(&mut self, env: &HandlerEnv) {
        let err = match self.remote.as_ref().unwrap().take_error() {
            Ok(e) => e,
            Err(e) => Some(e),
        };
        if let Some(e) = err {
            return self.destroy(env.registry, &format!("upstream unreachable: {}", e));
        }
        self.stage = Stage::Stream;
        self.flush_pending_to_remote(env.registry);
        if !self.destroyed {
            self.update_stream(env.registry);
        }
    }

    fn pump_local_to_remote(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_local(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "peer closed stream"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        let payload = if self.is_local {
            self.cipher.encrypt(&buf[..n])
        } else {
            let out = self.cipher.decrypt(&buf[..n]);
            if out.is_empty() {
                return self.destroy(env.registry, "cipher failed to decode stream data");
            }
            out
        };
        self.write_to_remote(&payload, env.registry);
    }

    fn pump_remote_to_local(&mut self, env: &HandlerEnv) {
        let mut buf = [0u8; BUF_SIZE];
        let n = match self.recv_remote(&mut buf) {
            Ok(0) => return self.destroy(env.registry, "upstream closed stream"),
            Ok(n) => n,
            Err(e) => return self.handle_recv_error(e, env),
        };
        let payload = if self.is_local {
            let out = self.cipher.decrypt(&buf[..n]);
            if out.is_empty() {
                return self.destroy(env.registry, "cipher failed to decode stream data");
            }
            out
        } else {
            self.cipher.encrypt(&buf[..n])
        };
        self.write_to_local(&payload, env.registry);
    }

    fn handle_recv_error(&mut self, e: io::Error, env: &HandlerEnv) {
        if would_block_or_benign(&e) {
            return;
        }
        self.destroy(env.registry, &format!("recv error: {}", e));
    }

    fn enqueue_to_local(&mut self, data: &[u8], env: &HandlerEnv) {
        self.pending_to_local.extend_from_slice(data);
        self.flush_pending_to_local(env.registry);
    }

    fn write_to_remote(&mut self, data: &[u8], registry: &Registry) {
        if self.pending_to_remote.len() + data.len() > MAX_PENDING_BYTES {
            return self.destroy(registry, "pending-to-remote buffer overflowed");
        }
        self.pending_to_remote.extend_from_slice(data);
        self.flush_pending_to_remote(registry);
    }

    fn write_to_local(&mut self, data: &[u8], registry: &Registry) {
        if self.pending_to_local.len() + data.len() > MAX_PENDING_BYTES {
            return self.destroy(registry, "pending-to-local buffer overflowed");
        }
        self.pending_to_local.extend_from_slice(data);
        self.flush_pending_to_local(registry);
    }

    /// The shared byte-pump primitive from spec.md §4.2.5, specialized
    /// per direction because each side owns a different socket and a
    /// different status field.
    fn flush_pending_to_local(&mut self, registry: &Registry) {
        if self.pending_to_local.is_empty() {
            return;
        }
        match self.local.write(&self.pending_to_local) {
            Ok(written) => {
                self.pending_to_local.advance(written);
                self.downstream_status = if self.pending_to_local.is_empty() {
                    IoStatus::READING
                } else {
                    IoStatus::WRITING
                };
            }
            Err(e) if would_block_or_benign(&e) => {
                self.downstream_status = IoStatus::WRITING;
            }
            Err(e) => return self.destroy(registry, &format!("send to local failed: {}", e)),
        }
        if self.stage == Stage::Stream || self.stage == Stage::UdpAssoc {
            self.update_stream(registry);
        } else {
            self.update_local_interest(registry);
        }
    }

    fn flush_pending_to_remote(&mut self, registry: &Registry) {
        let remote = match self.remote.as_mut() {
            Some(r) => r,
            None => return,
        };
        if self.pending_to_remote.is_empty() {
            self.upstream_status = IoStatus::READING;
            return;
        }
        match remote.write(&self.pending_to_remote) {
            Ok(written) => {
                self.pending_to_remote.advance(written);
                self.upstream_status = if self.pending_to_remote.is_empty() {
                    IoStatus::READING
                } else {
                    IoStatus::WRITING
                };
            }
            Err(e) if would_block_or_benign(&e) => {
                self.upstream_status = IoStatus::WRITING;
            }
            Err(e) => return self.destroy(registry, &format!("send to remote failed: {}", e)),
        }
        if self.stage == Stage::Stream {
            self.update_stream(registry);
        }
    }

    fn update_local_interest(&mut self, registry: &Registry) {
        let want_out = self.downstream_status.has_writing();
        let want_in = self.upstream_status.has_reading();
        let token = token_for_fd(self.local.as_raw_fd());
        apply_interest(registry, &mut self.local, token, &mut self.local_registered, want_in, want_out);
    }

    /// Recomputes both sockets' poller interest from the current
    /// direction statuses (spec.md §4.2.6): if the far side cannot
    /// drain its outbound queue, stop reading from the near side by
    /// deregistering it rather than leaving a read interest behind.
    fn update_stream(&mut self, registry: &Registry) {
        self.update_local_interest(registry);
        if let Some(remote) = self.remote.as_mut() {
            let want_out = self.upstream_status.has_writing();
            let want_in = self.downstream_status.has_reading();
            let token = token_for_fd(remote.as_raw_fd());
            apply_interest(registry, remote, token, &mut self.remote_registered, want_in, want_out);
        }
    }
}

/// Applies a direction's wanted interest to a socket already tracked by
/// `registered`. `mio::Interest` cannot be empty, so "no interest" is
/// expressed by deregistering the socket outright (spec.md §4.2.6,
/// testable property 5) rather than falling back to a baseline
/// `READABLE` — the near side must actually stop being woken for reads
/// while the far side's outbound queue is still full. Re-registers (not
/// merely reregisters) once interest returns, since the socket was
/// fully removed from the registry while idle.
fn apply_interest(
    registry: &Registry,
    source: &mut impl mio::event::Source,
    token: Token,
    registered: &mut bool,
    want_in: bool,
    want_out: bool,
) {
    if !want_in && !want_out {
        if *registered {
            let _ = registry.deregister(source);
            *registered = false;
        }
        return;
    }
    let interest = combine_interest(want_in, want_out);
    if *registered {
        let _ = registry.reregister(source, token, interest);
    } else {
        let _ = registry.register(source, token, interest);
        *registered = true;
    }
}

fn combine_interest(want_in: bool, want_out: bool) -> Interest {
    match (want_in, want_out) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("apply_interest deregisters instead of calling combine_interest with no interest"),
    }
}

fn would_block_or_benign(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
