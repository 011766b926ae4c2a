//! The dispatcher and handler table from spec.md §3/§4.1, grounded on
//! `Endpoint` in `endpoint.rs` — a `Slab` of per-connection state plus
//! `FnvHashMap` routing tables, driven by one external event source at
//! a time rather than owning its own reactor.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use fnv::FnvHashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Registry, Token};
use slab::Slab;
use slog::Logger;
use socket2::{Domain, Socket, Type};

use crate::cipher::{StreamCipher, TableCipher};
use crate::error::{BindError, ServerError};
use crate::handler::{Handler, HandlerEnv, Progress};
use crate::resolver::Resolver;
use crate::timeout::{TimeoutQueue, TIMEOUT_PRECISION};

pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Spec.md §4.1/§6: "listens with backlog ≈1024".
const LISTEN_BACKLOG: i32 = 1024;

/// A handler's identity across its lifetime, deliberately independent
/// of its `Slab` key (spec.md §9 Design Notes): the slab reuses freed
/// slots immediately, so a key alone cannot distinguish "the same
/// handler, still alive" from "a different handler that landed in the
/// same slot after the first one died". This counter never wraps in
/// practice and never gets reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

/// Binds a listener, owns the handler table, and turns readiness
/// events into handler calls. One `Server` runs one role (local or
/// remote) on one thread; nothing here is `Sync`.
pub struct Server {
    log: Logger,
    is_local: bool,
    password: Vec<u8>,
    timeout: u64,
    relay_addr: Option<SocketAddr>,
    resolver: Arc<dyn Resolver>,
    listener: TcpListener,
    handlers: Slab<Handler>,
    fd_to_slot: FnvHashMap<RawFd, usize>,
    id_to_slot: FnvHashMap<u64, usize>,
    timeouts: TimeoutQueue,
    next_handler_id: u64,
    last_sweep: u64,
    closed: bool,
}

/// Spec.md §4.1 "bind-and-listen": a reusable-address, non-blocking TCP
/// listener with a real backlog, built through `socket2` the way
/// `smartdevcode-shadowsocks-rust` and `janm-dev-links` do it, then
/// handed off to `mio` as a plain fd. `mio::net::TcpListener::bind`
/// alone exposes neither `SO_REUSEADDR` nor a configurable backlog.
fn bind_reusable(addr: SocketAddr) -> Result<TcpListener, BindError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| BindError::Bind(addr, e))?;
    socket.set_reuse_address(true).map_err(|e| BindError::Bind(addr, e))?;
    socket.set_nonblocking(true).map_err(|e| BindError::Bind(addr, e))?;
    socket.bind(&addr.into()).map_err(|e| BindError::Bind(addr, e))?;
    socket.listen(LISTEN_BACKLOG).map_err(|e| BindError::Listen(addr, e))?;
    TcpListener::from_std(socket.into()).map_err(|e| BindError::Listen(addr, e))
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        listen_addr: SocketAddr,
        is_local: bool,
        password: Vec<u8>,
        timeout: u64,
        relay_addr: Option<SocketAddr>,
        resolver: Arc<dyn Resolver>,
        log: Logger,
    ) -> Result<Server, BindError> {
        let listener = bind_reusable(listen_addr)?;
        Ok(Server {
            log,
            is_local,
            password,
            timeout,
            relay_addr,
            resolver,
            listener,
            handlers: Slab::new(),
            fd_to_slot: FnvHashMap::default(),
            id_to_slot: FnvHashMap::default(),
            timeouts: TimeoutQueue::new(),
            next_handler_id: 0,
            last_sweep: 0,
            closed: false,
        })
    }

    pub fn attach_to_loop(&mut self, registry: &Registry) -> Result<(), BindError> {
        registry
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(BindError::Register)
    }

    /// The listener's actual bound address — notably different from
    /// the configured one when the configured port is 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Processes one batch of poller events, then runs the idle sweep
    /// if at least [`TIMEOUT_PRECISION`] seconds have passed since the
    /// last one (spec.md §4.1 — the sweep piggybacks on dispatch
    /// rather than owning its own timer).
    pub fn dispatch(&mut self, events: &Events, registry: &Registry, now: u64) -> Result<(), ServerError> {
        for event in events {
            if event.token() == LISTENER_TOKEN {
                if event.is_error() {
                    return Err(ServerError::ListenerFailed(io::Error::new(
                        io::ErrorKind::Other,
                        "listening socket reported an error",
                    )));
                }
                if event.is_readable() {
                    self.accept_all(registry, now);
                }
                continue;
            }
            self.dispatch_handler_event(event.token(), event.is_readable(), event.is_writable(), registry, now);
        }
        if now.saturating_sub(self.last_sweep) >= TIMEOUT_PRECISION {
            self.sweep(now, registry);
            self.last_sweep = now;
        }
        Ok(())
    }

    fn dispatch_handler_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        registry: &Registry,
        now: u64,
    ) {
        let fd = token.0 as RawFd;
        let slot = match self.fd_to_slot.get(&fd) {
            Some(&slot) => slot,
            None => return,
        };
        let prior_activity = self.handlers[slot].last_activity();
        let is_local_fd = self.handlers[slot].local_fd() == fd;
        let env = HandlerEnv {
            registry,
            resolver: self.resolver.as_ref(),
            relay_addr: self.relay_addr,
            timeout: self.timeout,
        };
        let handler = &mut self.handlers[slot];
        let progress = if is_local_fd {
            handler.on_local_event(readable, writable, &env)
        } else {
            handler.on_remote_event(readable, writable, &env)
        };
        match progress {
            Progress::Continue => {
                if let Some(remote_fd) = handler.remote_fd() {
                    self.fd_to_slot.entry(remote_fd).or_insert(slot);
                }
                let id = handler.id();
                if self.timeouts.touch(id, now, prior_activity) {
                    self.handlers[slot].touch(now);
                }
            }
            Progress::Destroyed => self.destroy_slot(slot, registry, "peer or protocol error"),
        }
    }

    fn accept_all(&mut self, registry: &Registry, now: u64) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = self.next_id();
                    let log = self.log.new(slog::o!("handler" => id.0, "peer" => peer.to_string()));
                    let cipher: Box<dyn StreamCipher> = Box::new(TableCipher::new(&self.password));
                    match Handler::new(id, stream, self.is_local, cipher, now, registry, log) {
                        Ok(handler) => {
                            let fd = handler.local_fd();
                            let slot = self.handlers.insert(handler);
                            self.fd_to_slot.insert(fd, slot);
                            self.id_to_slot.insert(id.0, slot);
                            self.timeouts.insert(id, now);
                        }
                        Err(e) => {
                            slog::warn!(self.log, "failed to initialize accepted connection"; "error" => %e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    slog::warn!(self.log, "accept failed"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn next_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler_id);
        self.next_handler_id += 1;
        id
    }

    fn sweep(&mut self, now: u64, registry: &Registry) {
        let expired = self.timeouts.sweep(now, self.timeout);
        for id in expired {
            if let Some(&slot) = self.id_to_slot.get(&id.0) {
                self.destroy_slot(slot, registry, "idle timeout");
            }
        }
    }

    fn destroy_slot(&mut self, slot: usize, registry: &Registry, reason: &str) {
        if !self.handlers.contains(slot) {
            return;
        }
        self.handlers[slot].destroy(registry, reason);
        let handler = self.handlers.remove(slot);
        self.fd_to_slot.remove(&handler.local_fd());
        if let Some(fd) = handler.remote_fd() {
            self.fd_to_slot.remove(&fd);
        }
        self.id_to_slot.remove(&handler.id().0);
        self.timeouts.remove(handler.id());
    }

    /// Marks the server closed and deregisters the listener. Per
    /// spec.md §4.1, live handlers are not force-killed here — they
    /// keep draining their pending queues and get reclaimed the
    /// ordinary way, by peer close or the idle sweep. Idempotent; safe
    /// to call from a shutdown signal handler.
    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = registry.deregister(&mut self.listener);
    }
}
