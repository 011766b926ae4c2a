//! Local-role entry point: speaks SOCKS5 to ordinary clients and
//! forwards encrypted traffic to the configured remote relay.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mio::{Events, Poll};

use ss_relay_core::resolver::{Resolver, StdResolver};
use ss_relay_core::timeout::TIMEOUT_PRECISION;
use ss_relay_core::{logging, now_secs, Config, Server};

#[derive(Parser)]
#[command(about = "Encrypted SOCKS5 tunnel: local (client-facing) role")]
struct Args {
    #[arg(short = 'c', long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();
    let log = logging::term_logger();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let listen_addr = match config.listen_address(true) {
        Ok(a) => a,
        Err(e) => {
            slog::error!(log, "configuration error"; "error" => %e);
            process::exit(1);
        }
    };

    let resolver = StdResolver;
    let (relay_host, relay_port) = match config.remote_relay_address() {
        Some(pair) => pair,
        None => {
            slog::error!(log, "configuration error"; "error" => "server and server_port are required for the local role");
            process::exit(1);
        }
    };
    let relay_addr = match resolver.resolve(&relay_host, relay_port) {
        Ok(a) => a,
        Err(e) => {
            slog::error!(log, "failed to resolve remote relay address"; "error" => %e);
            process::exit(1);
        }
    };

    let mut server = match Server::bind(
        listen_addr,
        true,
        config.password.clone().into_bytes(),
        config.timeout,
        Some(relay_addr),
        Arc::new(resolver),
        log.clone(),
    ) {
        Ok(s) => s,
        Err(e) => {
            slog::error!(log, "failed to bind"; "error" => %e);
            process::exit(1);
        }
    };

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            slog::error!(log, "failed to create poller"; "error" => %e);
            process::exit(1);
        }
    };
    if let Err(e) = server.attach_to_loop(poll.registry()) {
        slog::error!(log, "failed to register listener"; "error" => %e);
        process::exit(1);
    }

    slog::info!(log, "listening"; "addr" => %listen_addr, "relay" => %relay_addr, "role" => "local");

    let mut events = Events::with_capacity(1024);
    loop {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(TIMEOUT_PRECISION))) {
            slog::error!(log, "poll failed"; "error" => %e);
            break;
        }
        let now = now_secs();
        if let Err(e) = server.dispatch(&events, poll.registry(), now) {
            slog::error!(log, "fatal dispatch error"; "error" => %e);
            break;
        }
    }

    server.close(poll.registry());
}
