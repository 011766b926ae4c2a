use std::io;

use failure::Fail;

/// Errors that can occur while loading a [`Config`](crate::config::Config).
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "failed to read config file {}: {}", _0, _1)]
    Read(String, io::Error),
    #[fail(display = "failed to parse config file {}: {}", _0, _1)]
    Parse(String, toml::de::Error),
    #[fail(display = "local role requires local_address and local_port")]
    MissingLocalAddress,
    #[fail(display = "remote role requires server and server_port")]
    MissingServerAddress,
    #[fail(display = "{}:{} did not resolve to any address", _0, _1)]
    UnresolvedListenAddress(String, u16),
}

/// Errors that can occur while binding the listening socket.
#[derive(Debug, Fail)]
pub enum BindError {
    #[fail(display = "failed to bind {}: {}", _0, _1)]
    Bind(std::net::SocketAddr, io::Error),
    #[fail(display = "failed to listen on {}: {}", _0, _1)]
    Listen(std::net::SocketAddr, io::Error),
    #[fail(display = "failed to register listener with poller: {}", _0)]
    Register(io::Error),
}

/// A fatal error on the listening socket; the server cannot continue.
#[derive(Debug, Fail)]
pub enum ServerError {
    #[fail(display = "listener reported an error and cannot continue: {}", _0)]
    ListenerFailed(io::Error),
}
